//! JIT compiler threads and how busy they are.
//!
//! Compiler threads are runtime-internal daemons, so this reads every thread
//! of a snapshot rather than the filtered view.

use facet::Facet;
use stallscope_types::{Snapshot, ThreadState};

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::context::CorrelationContext;
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};
use crate::trend::Trend;

const BUSY_COMPILERS: usize = 2;
const VERY_BUSY_COMPILERS: usize = 4;

pub fn is_compiler_thread(name: &str) -> bool {
    ["C1 CompilerThread", "C2 CompilerThread", "JVMCI CompilerThread", "GraalCompilerThread"]
        .iter()
        .any(|p| name.contains(p))
        || name.starts_with("CompilerThread")
}

fn is_c1(name: &str) -> bool {
    name.contains("C1 CompilerThread")
}

fn is_c2(name: &str) -> bool {
    name.contains("C2 CompilerThread")
}

#[derive(Facet, Clone, Debug, Default, PartialEq)]
pub struct CompilerStats {
    /// Distinct compiler thread names across all snapshots.
    pub compiler_threads: Vec<String>,
    /// Runnable compiler threads per snapshot, averaged and rounded down.
    pub active: usize,
    pub active_c1: usize,
    pub active_c2: usize,
}

impl CompilerStats {
    pub fn has_c1_activity(&self) -> bool {
        self.active_c1 > 0
    }

    pub fn has_c2_activity(&self) -> bool {
        self.active_c2 > 0
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct CompilerReport {
    pub stats: CompilerStats,
    pub active_per_snapshot: Vec<usize>,
    /// Only for multi-snapshot runs.
    #[facet(skip_unless_truthy)]
    pub active_trend: Option<Trend>,
}

impl CompilerReport {
    pub fn summary(&self) -> String {
        if self.stats.compiler_threads.is_empty() {
            return "No compiler threads detected".to_string();
        }
        let mut out = format!("{} compiler thread(s)", self.stats.compiler_threads.len());
        if self.stats.active > 0 {
            out.push_str(&format!(", {} active", self.stats.active));
        }
        out
    }
}

pub struct CompilerAnalyzer;

impl CompilerAnalyzer {
    pub const NAME: &'static str = "compiler";
}

impl Analyzer for CompilerAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Analyzes JIT compiler thread activity"
    }

    fn priority(&self) -> i32 {
        35
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let mut compiler_threads: Vec<String> = Vec::new();
        let (mut c1, mut c2) = (0usize, 0usize);
        let mut active_per_snapshot = Vec::with_capacity(ctx.snapshot_count());

        for snapshot in ctx.snapshots() {
            let mut active = 0;
            for (name, state) in compilers(snapshot) {
                if !compiler_threads.iter().any(|n| n == name) {
                    compiler_threads.push(name.to_string());
                }
                if state == Some(ThreadState::Runnable) {
                    active += 1;
                    if is_c1(name) {
                        c1 += 1;
                    } else if is_c2(name) {
                        c2 += 1;
                    }
                }
            }
            active_per_snapshot.push(active);
        }

        let count = ctx.snapshot_count().max(1);
        let stats = CompilerStats {
            compiler_threads,
            active: active_per_snapshot.iter().sum::<usize>() / count,
            active_c1: c1 / count,
            active_c2: c2 / count,
        };

        let mut findings = Vec::new();
        if stats.active > BUSY_COMPILERS {
            let severity = if stats.active > VERY_BUSY_COMPILERS {
                Severity::Warning
            } else {
                Severity::Info
            };
            findings.push(
                Finding::builder(
                    severity,
                    "high-compiler-activity",
                    format!(
                        "High compiler activity: {} compiler threads active",
                        stats.active
                    ),
                )
                .detail("active_threads", &stats.active)
                .detail("c1_active", &stats.active_c1)
                .detail("c2_active", &stats.active_c2)
                .build(),
            );
        }

        let active_trend = ctx.is_multi().then(|| {
            let values: Vec<f64> = active_per_snapshot.iter().map(|&n| n as f64).collect();
            Trend::of(&values)
        });

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::Compiler(CompilerReport {
                stats,
                active_per_snapshot,
                active_trend,
            }),
        ))
    }
}

fn compilers(snapshot: &Snapshot) -> impl Iterator<Item = (&str, Option<ThreadState>)> {
    snapshot.threads.iter().filter_map(|t| {
        let name = t.name.as_deref()?;
        is_compiler_thread(name).then_some((name, t.state))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::test_support::*;
    use crate::trend::TrendDirection;

    fn jit_threads(active_c2: usize, idle: usize) -> Vec<stallscope_types::ThreadRecord> {
        let mut threads: Vec<_> = (0..active_c2)
            .map(|i| thread(&format!("C2 CompilerThread{i}"), ThreadState::Runnable))
            .collect();
        threads.extend(
            (0..idle).map(|i| thread(&format!("C1 CompilerThread{i}"), ThreadState::Waiting)),
        );
        threads
    }

    fn report(result: &AnalysisResult) -> &CompilerReport {
        match &result.payload {
            ResultPayload::Compiler(r) => r,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn names() {
        assert!(is_compiler_thread("C2 CompilerThread0"));
        assert!(is_compiler_thread("JVMCI CompilerThread3"));
        assert!(is_compiler_thread("CompilerThread1"));
        assert!(!is_compiler_thread("main"));
    }

    #[test]
    fn busy_compilers_are_reported() {
        let c = ctx(vec![snapshot(0, jit_threads(3, 1))]);
        let result = CompilerAnalyzer.analyze(&c).unwrap();
        assert_eq!(
            result.findings[0].message,
            "High compiler activity: 3 compiler threads active"
        );
        assert_eq!(result.severity, Severity::Info);
        assert_eq!(result.summary(), "4 compiler thread(s), 3 active");
        assert_eq!(report(&result).stats.active_c2, 3);
        assert!(report(&result).active_trend.is_none());
    }

    #[test]
    fn activity_is_averaged_over_snapshots() {
        let c = ctx(vec![
            snapshot(0, jit_threads(5, 0)),
            snapshot(1_000, jit_threads(1, 4)),
        ]);
        let result = CompilerAnalyzer.analyze(&c).unwrap();
        let r = report(&result);
        assert_eq!(r.stats.active, 3);
        assert_eq!(r.stats.compiler_threads.len(), 9);
        assert_eq!(r.active_per_snapshot, vec![5, 1]);
        assert_eq!(
            r.active_trend.as_ref().map(|t| t.direction),
            Some(TrendDirection::Decreasing)
        );
    }

    #[test]
    fn very_busy_compilers_warn() {
        let c = ctx(vec![snapshot(0, jit_threads(5, 0))]);
        let result = CompilerAnalyzer.analyze(&c).unwrap();
        assert_eq!(result.severity, Severity::Warning);
    }

    #[test]
    fn no_compilers() {
        let c = ctx(vec![snapshot(0, vec![thread("main", ThreadState::Runnable)])]);
        let result = CompilerAnalyzer.analyze(&c).unwrap();
        assert_eq!(result.summary(), "No compiler threads detected");
        assert!(result.findings.is_empty());
    }
}
