//! Severity, findings and the result envelope every analyzer returns.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use facet::Facet;
use facet_value::Value;

use crate::analyzers::churn::ChurnReport;
use crate::analyzers::class_loading::ClassLoadingReport;
use crate::analyzers::compiler::CompilerReport;
use crate::analyzers::deadlock::DeadlockReport;
use crate::analyzers::gc::GcReport;
use crate::analyzers::io_block::IoBlockReport;
use crate::analyzers::lock_contention::LockContentionReport;
use crate::analyzers::native::NativeReport;
use crate::analyzers::profiling::ProfilingReport;
use crate::analyzers::progress::ProgressReport;
use crate::analyzers::similar_stack::SimilarStackReport;
use crate::analyzers::stack_group::StackGroupReport;
use crate::analyzers::thread_pool::ThreadPoolReport;
use crate::analyzers::verdict::VerdictReport;

// ── Severity ────────────────────────────────────────────────────

/// Totally ordered: `Ok < Info < Warning < Error < Critical`.
#[derive(Facet, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Ok,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn is_worse_than(self, other: Severity) -> bool {
        self > other
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Finding ─────────────────────────────────────────────────────

/// One observation, immutable once built.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct Finding {
    pub severity: Severity,
    pub category: String,
    pub message: String,
    /// Names of the threads involved.
    #[facet(default)]
    pub affected_threads: Vec<String>,
    #[facet(default)]
    pub details: BTreeMap<String, Value>,
}

impl Finding {
    pub fn new(severity: Severity, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::builder(severity, category, message).build()
    }

    pub fn builder(
        severity: Severity,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> FindingBuilder {
        FindingBuilder {
            severity,
            category: category.into(),
            message: message.into(),
            affected_threads: Vec::new(),
            details: BTreeMap::new(),
        }
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}

pub struct FindingBuilder {
    severity: Severity,
    category: String,
    message: String,
    affected_threads: Vec<String>,
    details: BTreeMap<String, Value>,
}

impl FindingBuilder {
    pub fn affected_thread(mut self, name: impl Into<String>) -> Self {
        self.affected_threads.push(name.into());
        self
    }

    pub fn affected_threads<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affected_threads.extend(names.into_iter().map(Into::into));
        self
    }

    /// Typed detail value. A value that cannot be represented becomes null.
    pub fn detail<V>(mut self, key: impl Into<String>, value: &V) -> Self
    where
        V: for<'facet> Facet<'facet>,
    {
        let value = facet_value::to_value(value).unwrap_or(Value::NULL);
        self.details.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Finding {
        Finding {
            severity: self.severity,
            category: self.category,
            message: self.message,
            affected_threads: self.affected_threads,
            details: self.details,
        }
    }
}

// ── Result envelope ─────────────────────────────────────────────

/// Failure descriptor carried by synthetic error results.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ErrorReport {
    pub message: String,
}

/// Analyzer-specific data attached to a result.
#[derive(Facet, Clone, Debug)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum ResultPayload {
    Deadlock(DeadlockReport),
    Progress(ProgressReport),
    StackGroup(StackGroupReport),
    SimilarStack(SimilarStackReport),
    ThreadChurn(ChurnReport),
    LockContention(LockContentionReport),
    GcActivity(GcReport),
    ThreadPool(ThreadPoolReport),
    IoBlock(IoBlockReport),
    NativeResource(NativeReport),
    Compiler(CompilerReport),
    ClassLoading(ClassLoadingReport),
    TraceProfiling(ProfilingReport),
    Verdict(VerdictReport),
    Error(ErrorReport),
}

impl ResultPayload {
    pub fn summary(&self) -> String {
        match self {
            Self::Deadlock(r) => r.summary(),
            Self::Progress(r) => r.summary(),
            Self::StackGroup(r) => r.summary(),
            Self::SimilarStack(r) => r.summary(),
            Self::ThreadChurn(r) => r.summary(),
            Self::LockContention(r) => r.summary(),
            Self::GcActivity(r) => r.summary(),
            Self::ThreadPool(r) => r.summary(),
            Self::IoBlock(r) => r.summary(),
            Self::NativeResource(r) => r.summary(),
            Self::Compiler(r) => r.summary(),
            Self::ClassLoading(r) => r.summary(),
            Self::TraceProfiling(r) => r.summary(),
            Self::Verdict(r) => r.summary(),
            Self::Error(r) => format!("Error: {}", r.message),
        }
    }
}

/// Common envelope: who produced it, when, how bad, and what was found.
#[derive(Facet, Clone, Debug)]
pub struct AnalysisResult {
    pub analyzer: String,
    pub created_at_ms: u64,
    pub severity: Severity,
    #[facet(default)]
    pub findings: Vec<Finding>,
    pub payload: ResultPayload,
}

impl AnalysisResult {
    pub fn new(
        analyzer: impl Into<String>,
        severity: Severity,
        findings: Vec<Finding>,
        payload: ResultPayload,
    ) -> Self {
        Self {
            analyzer: analyzer.into(),
            created_at_ms: now_ms(),
            severity,
            findings,
            payload,
        }
    }

    /// Severity derived from the findings: the worst one, or `Ok`.
    pub fn from_findings(
        analyzer: impl Into<String>,
        findings: Vec<Finding>,
        payload: ResultPayload,
    ) -> Self {
        let severity = worst_of(&findings);
        Self::new(analyzer, severity, findings, payload)
    }

    /// Synthetic ERROR result for an analyzer that failed or could not run.
    pub fn error(analyzer: impl Into<String>, detail: impl Into<String>) -> Self {
        let message = detail.into();
        let finding = Finding::new(
            Severity::Error,
            "error",
            format!("Analysis failed: {message}"),
        );
        Self::new(
            analyzer,
            Severity::Error,
            vec![finding],
            ResultPayload::Error(ErrorReport { message }),
        )
    }

    pub fn summary(&self) -> String {
        self.payload.summary()
    }

    pub fn has_findings(&self) -> bool {
        !self.findings.is_empty()
    }

    pub fn findings_at_or_above(&self, severity: Severity) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.severity >= severity)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResultPayload::Error(_))
    }
}

pub fn worst_of(findings: &[Finding]) -> Severity {
    findings
        .iter()
        .map(|f| f.severity)
        .max()
        .unwrap_or(Severity::Ok)
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Composite ───────────────────────────────────────────────────

/// The outcome of one batch: every child result, in execution order.
#[derive(Facet, Clone, Debug)]
pub struct CompositeResult {
    pub analyzer: String,
    pub created_at_ms: u64,
    /// Worst child severity, `Ok` when there are no children.
    pub severity: Severity,
    /// Every child finding, worst first. Equal severities keep child order.
    pub findings: Vec<Finding>,
    pub results: Vec<AnalysisResult>,
}

impl CompositeResult {
    pub const NAME: &'static str = "CompositeAnalysis";

    pub fn new(results: Vec<AnalysisResult>) -> Self {
        let severity = results
            .iter()
            .map(|r| r.severity)
            .max()
            .unwrap_or(Severity::Ok);
        let mut findings: Vec<Finding> = results
            .iter()
            .flat_map(|r| r.findings.iter().cloned())
            .collect();
        findings.sort_by(|a, b| b.severity.cmp(&a.severity));
        Self {
            analyzer: Self::NAME.to_string(),
            created_at_ms: now_ms(),
            severity,
            findings,
            results,
        }
    }

    pub fn children(&self) -> &[AnalysisResult] {
        &self.results
    }

    pub fn child(&self, analyzer: &str) -> Option<&AnalysisResult> {
        self.results.iter().find(|r| r.analyzer == analyzer)
    }

    pub fn has_findings(&self) -> bool {
        !self.findings.is_empty()
    }

    pub fn findings_at_or_above(&self, severity: Severity) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.severity >= severity)
    }

    pub fn summary(&self) -> String {
        if self.results.is_empty() {
            return "No analysis results".to_string();
        }
        format!(
            "{} analyzers, {} findings, severity {}",
            self.results.len(),
            self.findings.len(),
            self.severity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, findings: Vec<Finding>) -> AnalysisResult {
        AnalysisResult::from_findings(
            name,
            findings,
            ResultPayload::Error(ErrorReport {
                message: String::new(),
            }),
        )
    }

    #[test]
    fn severity_is_totally_ordered() {
        assert!(Severity::Ok < Severity::Info);
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
        assert!(Severity::Critical.is_worse_than(Severity::Error));
        assert!(!Severity::Info.is_worse_than(Severity::Info));
        assert_eq!(Severity::Warning.level(), 2);
        assert_eq!(Severity::Ok.max(Severity::Warning), Severity::Warning);
    }

    #[test]
    fn builder_collects_threads_and_details() {
        let finding = Finding::builder(Severity::Warning, "lock-contention", "3 threads waiting")
            .affected_thread("a")
            .affected_threads(["b", "c"])
            .detail("waiters", &3u32)
            .build();
        assert_eq!(finding.affected_threads, vec!["a", "b", "c"]);
        assert!(finding.detail("waiters").is_some());
        assert!(finding.detail("missing").is_none());
    }

    #[test]
    fn severity_from_findings() {
        let r = result(
            "x",
            vec![
                Finding::new(Severity::Info, "a", "a"),
                Finding::new(Severity::Warning, "b", "b"),
            ],
        );
        assert_eq!(r.severity, Severity::Warning);
        assert_eq!(r.findings_at_or_above(Severity::Warning).count(), 1);
        assert_eq!(result("y", Vec::new()).severity, Severity::Ok);
    }

    #[test]
    fn composite_takes_worst_and_sorts_stably() {
        let composite = CompositeResult::new(vec![
            result(
                "first",
                vec![
                    Finding::new(Severity::Info, "i1", "info one"),
                    Finding::new(Severity::Warning, "w1", "warn one"),
                ],
            ),
            AnalysisResult::error("second", "boom"),
            result("third", vec![Finding::new(Severity::Info, "i2", "info two")]),
        ]);

        assert_eq!(composite.analyzer, "CompositeAnalysis");
        assert_eq!(composite.severity, Severity::Error);
        let categories: Vec<&str> = composite
            .findings
            .iter()
            .map(|f| f.category.as_str())
            .collect();
        assert_eq!(categories, vec!["error", "w1", "i1", "i2"]);
        assert!(composite.child("second").is_some_and(AnalysisResult::is_error));
        assert!(composite.child("missing").is_none());
        assert_eq!(
            composite.findings[0].message,
            "Analysis failed: boom"
        );
        assert_eq!(composite.child("second").unwrap().summary(), "Error: boom");
    }

    #[test]
    fn empty_composite_is_ok() {
        let composite = CompositeResult::new(Vec::new());
        assert_eq!(composite.severity, Severity::Ok);
        assert_eq!(composite.summary(), "No analysis results");
    }
}
