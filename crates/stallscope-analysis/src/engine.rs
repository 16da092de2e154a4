//! Analyzer registry and batch orchestration.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::analyzers;
use crate::context::CorrelationContext;
use crate::result::{AnalysisResult, CompositeResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    DuplicateAnalyzer { name: String },
    Inapplicable { name: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateAnalyzer { name } => write!(f, "Analyzer already registered: {name}"),
            Self::Inapplicable { name } => {
                write!(f, "Analyzer cannot analyze this context: {name}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// Named analyzers, kept in descending priority order. Equal priorities
/// keep registration order.
#[derive(Debug, Default)]
pub struct AnalysisEngine {
    analyzers: Vec<Box<dyn Analyzer>>,
}

impl AnalysisEngine {
    pub fn create_empty() -> Self {
        Self::default()
    }

    /// Every built-in analyzer.
    pub fn create_default() -> Self {
        default_registry()
    }

    pub fn builder() -> AnalysisEngineBuilder {
        AnalysisEngineBuilder::default()
    }

    pub fn register(&mut self, analyzer: Box<dyn Analyzer>) -> Result<(), EngineError> {
        let name = analyzer.name();
        if self.analyzer(name).is_some() {
            return Err(EngineError::DuplicateAnalyzer {
                name: name.to_string(),
            });
        }
        debug!(analyzer = name, priority = analyzer.priority(), "registered analyzer");
        self.analyzers.push(analyzer);
        // sort_by is stable: ties stay in registration order.
        self.analyzers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Ok(())
    }

    /// Removes `name` if present; returns whether anything was removed.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.analyzers.len();
        self.analyzers.retain(|a| a.name() != name);
        before != self.analyzers.len()
    }

    pub fn analyzer(&self, name: &str) -> Option<&dyn Analyzer> {
        self.analyzers
            .iter()
            .find(|a| a.name() == name)
            .map(|a| a.as_ref())
    }

    pub fn analyzers(&self) -> impl Iterator<Item = &dyn Analyzer> {
        self.analyzers.iter().map(|a| a.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.analyzers.iter().map(|a| a.name()).collect()
    }

    pub fn applicable_analyzers<'a>(
        &'a self,
        ctx: &'a CorrelationContext,
    ) -> impl Iterator<Item = &'a dyn Analyzer> + 'a {
        self.analyzers().filter(move |a| a.can_analyze(ctx))
    }

    /// Runs every applicable analyzer. A failing analyzer is replaced by a
    /// synthetic error result and the batch continues.
    pub fn analyze_all(&self, ctx: &CorrelationContext) -> CompositeResult {
        let results = self
            .analyzers()
            .filter_map(|analyzer| run_isolated(analyzer, ctx))
            .collect();
        CompositeResult::new(results)
    }

    /// Runs only the named analyzers, in the order given. Unknown or
    /// inapplicable names produce an error result for that name.
    pub fn analyze_named(&self, ctx: &CorrelationContext, names: &[&str]) -> CompositeResult {
        let results = names
            .iter()
            .map(|name| match self.analyzer(name) {
                None => AnalysisResult::error(*name, format!("Unknown analyzer: {name}")),
                Some(analyzer) => run_isolated(analyzer, ctx).unwrap_or_else(|| {
                    AnalysisResult::error(
                        *name,
                        EngineError::Inapplicable {
                            name: name.to_string(),
                        }
                        .to_string(),
                    )
                }),
            })
            .collect();
        CompositeResult::new(results)
    }

    /// Direct invocation without isolation.
    pub fn analyze_single(
        &self,
        ctx: &CorrelationContext,
        analyzer: &dyn Analyzer,
    ) -> Result<AnalysisResult, SingleRunError> {
        if !analyzer.can_analyze(ctx) {
            return Err(SingleRunError::Engine(EngineError::Inapplicable {
                name: analyzer.name().to_string(),
            }));
        }
        analyzer.analyze(ctx).map_err(SingleRunError::Analyzer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingleRunError {
    Engine(EngineError),
    Analyzer(AnalyzerError),
}

impl fmt::Display for SingleRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine(e) => e.fmt(f),
            Self::Analyzer(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for SingleRunError {}

/// Checks applicability and runs `analyzer`, both behind the panic guard.
/// `None` when the analyzer does not apply to `ctx`.
fn run_isolated(analyzer: &dyn Analyzer, ctx: &CorrelationContext) -> Option<AnalysisResult> {
    let name = analyzer.name();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        if !analyzer.can_analyze(ctx) {
            return None;
        }
        debug!(analyzer = name, "running analyzer");
        Some(analyzer.analyze(ctx))
    }));
    let result = match outcome {
        Ok(None) => return None,
        Ok(Some(Ok(result))) => {
            debug!(
                analyzer = name,
                severity = %result.severity,
                findings = result.findings.len(),
                "analyzer finished"
            );
            result
        }
        Ok(Some(Err(e))) => {
            warn!(analyzer = name, %e, "analyzer failed");
            AnalysisResult::error(name, e.message)
        }
        Err(payload) => {
            let detail = panic_message(payload.as_ref());
            warn!(analyzer = name, detail = %detail, "analyzer panicked");
            AnalysisResult::error(name, detail)
        }
    };
    Some(result)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "analyzer panicked".to_string()
    }
}

// ── Registry assembly ───────────────────────────────────────────

/// A fresh registry holding every built-in analyzer.
pub fn default_registry() -> AnalysisEngine {
    registry_without(&[])
}

/// The default registry minus the named analyzers.
pub fn registry_without(names: &[&str]) -> AnalysisEngine {
    let mut engine = AnalysisEngine::create_empty();
    for analyzer in analyzers::builtin() {
        if names.contains(&analyzer.name()) {
            continue;
        }
        // Built-in names are unique.
        let _ = engine.register(analyzer);
    }
    engine
}

/// Assembles an engine from explicit additions, exclusions and optionally
/// the built-in set. Explicit additions win over built-ins of the same name.
#[derive(Default)]
pub struct AnalysisEngineBuilder {
    with_defaults: bool,
    extra: Vec<Box<dyn Analyzer>>,
    excluded: Vec<String>,
}

impl AnalysisEngineBuilder {
    pub fn with_defaults(mut self) -> Self {
        self.with_defaults = true;
        self
    }

    pub fn with(mut self, analyzer: Box<dyn Analyzer>) -> Self {
        self.extra.push(analyzer);
        self
    }

    pub fn without(mut self, name: impl Into<String>) -> Self {
        self.excluded.push(name.into());
        self
    }

    pub fn build(self) -> Result<AnalysisEngine, EngineError> {
        let mut engine = AnalysisEngine::create_empty();
        for analyzer in self.extra {
            engine.register(analyzer)?;
        }
        if self.with_defaults {
            for analyzer in analyzers::builtin() {
                if engine.analyzer(analyzer.name()).is_none() {
                    engine.register(analyzer)?;
                }
            }
        }
        for name in &self.excluded {
            engine.unregister(name);
        }
        Ok(engine)
    }
}
