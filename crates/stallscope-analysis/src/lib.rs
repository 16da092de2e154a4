//! Correlation and analysis engine for thread-dump snapshots.
//!
//! A [`CorrelationContext`] wraps one or more snapshots (and optionally a
//! profiling trace) and answers identity and temporal questions about them.
//! Analyzers read the context and return an [`AnalysisResult`]; the
//! [`AnalysisEngine`] runs a registry of analyzers in priority order and
//! combines their results into a [`CompositeResult`].

pub mod analyzer;
pub mod analyzers;
pub mod context;
pub mod engine;
pub mod grouping;
pub mod identity;
pub mod options;
pub mod profile;
pub mod result;
pub mod trace;
pub mod trend;

pub use analyzer::{Analyzer, AnalyzerError};
pub use context::{ContextError, CorrelationContext};
pub use engine::{
    AnalysisEngine, AnalysisEngineBuilder, EngineError, SingleRunError, default_registry,
    registry_without,
};
pub use identity::ThreadIdentity;
pub use options::{AnalysisOptions, AnalysisOptionsBuilder, OptionsError, Thresholds, Toggles};
pub use result::{AnalysisResult, CompositeResult, Finding, ResultPayload, Severity};
pub use trace::{InMemoryTrace, JsonTraceFile, TraceLoadError, TraceSource};
pub use trend::{Trend, TrendDirection};
