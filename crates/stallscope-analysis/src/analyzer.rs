//! The capability every analyzer implements.

use std::fmt;

use crate::context::CorrelationContext;
use crate::result::AnalysisResult;

/// Failure descriptor returned by an analyzer that could not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerError {
    pub message: String,
}

impl AnalyzerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for AnalyzerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AnalyzerError {}

/// A read-only pass over a [`CorrelationContext`].
///
/// Analyzers never mutate the context; the engine may run them in any
/// order but always collects results by descending priority.
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn requires_multiple_snapshots(&self) -> bool {
        false
    }

    fn requires_trace(&self) -> bool {
        false
    }

    /// Applicability test. The default honors the two requirement flags.
    fn can_analyze(&self, ctx: &CorrelationContext) -> bool {
        (!self.requires_multiple_snapshots() || ctx.is_multi())
            && (!self.requires_trace() || ctx.has_trace())
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError>;
}

impl fmt::Debug for dyn Analyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analyzer")
            .field("name", &self.name())
            .field("priority", &self.priority())
            .finish()
    }
}
