//! Garbage collector threads and how much of the process they occupy.
//!
//! Works on every thread of a snapshot, not the filtered view: GC threads are
//! excluded from the default filter, and they are exactly what this looks at.

use facet::Facet;
use stallscope_types::{Snapshot, ThreadRecord, ThreadState};

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::context::CorrelationContext;
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};

const GC_NAME_PATTERNS: &[&str] = &[
    "GC Thread",
    "G1 Young RemSet",
    "G1 Main Marker",
    "G1 Conc#",
    "G1 Refine#",
    "G1 Service",
    "GC task thread",
    "Gang worker",
    "Concurrent Mark",
    "VM Periodic Task",
    "ZGC",
    "Shenandoah",
];
const SAFEPOINT_CLASSES: &[&str] = &["SafepointSynchronize", "VMThread"];
/// Fraction of app threads at a safepoint that suggests a stop-the-world pause.
const STW_FRACTION: f64 = 0.8;
const HIGH_GC_CPU_PCT: f64 = 20.0;

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct GcSnapshot {
    pub snapshot_index: usize,
    pub timestamp_ms: i64,
    pub gc_threads: usize,
    pub runnable_gc_threads: usize,
    pub app_threads: usize,
    pub app_threads_at_safepoint: usize,
    pub gc_cpu_ms: f64,
    pub app_cpu_ms: f64,
    pub gc_cpu_pct: f64,
}

impl GcSnapshot {
    pub fn suggests_stop_the_world(&self) -> bool {
        self.app_threads_at_safepoint as f64 > self.app_threads as f64 * STW_FRACTION
    }
}

#[derive(Facet, Clone, Debug, Default, PartialEq)]
pub struct GcSummary {
    pub avg_gc_cpu_pct: f64,
    pub max_gc_cpu_pct: f64,
    pub max_runnable_gc_threads: usize,
    pub max_threads_at_safepoint: usize,
    pub potential_stw: bool,
    pub high_gc_cpu: bool,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct GcReport {
    pub snapshots: Vec<GcSnapshot>,
    pub stats: GcSummary,
}

impl GcReport {
    pub fn summary(&self) -> String {
        if self.stats.potential_stw {
            format!(
                "GC activity: potential STW detected, {:.1}% avg CPU",
                self.stats.avg_gc_cpu_pct
            )
        } else if self.stats.high_gc_cpu {
            format!(
                "GC activity: high CPU usage {:.1}% avg",
                self.stats.avg_gc_cpu_pct
            )
        } else {
            format!("GC activity: {:.1}% avg CPU", self.stats.avg_gc_cpu_pct)
        }
    }
}

pub struct GcActivityAnalyzer;

impl GcActivityAnalyzer {
    pub const NAME: &'static str = "gc-activity";
}

impl Analyzer for GcActivityAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Analyzes GC thread behavior and its impact on application threads"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let snapshots: Vec<GcSnapshot> = ctx
            .snapshots()
            .iter()
            .enumerate()
            .map(|(index, snapshot)| measure(index, snapshot))
            .collect();

        let mut findings: Vec<Finding> = snapshots
            .iter()
            .filter(|s| s.suggests_stop_the_world())
            .map(|s| {
                Finding::builder(
                    Severity::Warning,
                    "gc-stw",
                    format!(
                        "Potential STW GC pause: {}/{} app threads at safepoint",
                        s.app_threads_at_safepoint, s.app_threads
                    ),
                )
                .detail("snapshot_index", &s.snapshot_index)
                .detail("threads_at_safepoint", &s.app_threads_at_safepoint)
                .build()
            })
            .collect();

        let stats = summarize(&snapshots);
        if stats.high_gc_cpu {
            findings.push(
                Finding::builder(
                    Severity::Warning,
                    "gc-high-cpu",
                    format!(
                        "High GC CPU usage: {:.1}% average (max {:.1}%)",
                        stats.avg_gc_cpu_pct, stats.max_gc_cpu_pct
                    ),
                )
                .detail("avg_gc_cpu_pct", &stats.avg_gc_cpu_pct)
                .detail("max_gc_cpu_pct", &stats.max_gc_cpu_pct)
                .build(),
            );
        }

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::GcActivity(GcReport { snapshots, stats }),
        ))
    }
}

pub fn is_gc_worker(name: &str) -> bool {
    GC_NAME_PATTERNS.iter().any(|p| name.contains(p))
}

/// A non-running thread parked in safepoint machinery, or simply blocked or
/// waiting while the collector may hold the world.
fn at_safepoint(thread: &ThreadRecord) -> bool {
    if thread.is_in(ThreadState::Runnable) {
        return false;
    }
    let in_safepoint_frame = thread
        .stack
        .iter()
        .any(|f| SAFEPOINT_CLASSES.iter().any(|c| f.class_name.contains(c)));
    in_safepoint_frame || thread.is_in(ThreadState::Blocked) || thread.is_in(ThreadState::Waiting)
}

fn measure(snapshot_index: usize, snapshot: &Snapshot) -> GcSnapshot {
    let (gc, app): (Vec<&ThreadRecord>, Vec<&ThreadRecord>) = snapshot
        .threads
        .iter()
        .partition(|t| t.name.as_deref().is_some_and(is_gc_worker));

    let gc_cpu_ms = total_cpu_ms(&gc);
    let app_cpu_ms = total_cpu_ms(&app);
    let total = gc_cpu_ms + app_cpu_ms;

    GcSnapshot {
        snapshot_index,
        timestamp_ms: snapshot.timestamp_ms,
        gc_threads: gc.len(),
        runnable_gc_threads: gc.iter().filter(|t| t.is_in(ThreadState::Runnable)).count(),
        app_threads: app.len(),
        app_threads_at_safepoint: app.iter().filter(|t| at_safepoint(t)).count(),
        gc_cpu_ms,
        app_cpu_ms,
        gc_cpu_pct: if total > 0.0 { gc_cpu_ms * 100.0 / total } else { 0.0 },
    }
}

fn total_cpu_ms(threads: &[&ThreadRecord]) -> f64 {
    threads.iter().filter_map(|t| t.cpu_time_ms).sum()
}

fn summarize(snapshots: &[GcSnapshot]) -> GcSummary {
    if snapshots.is_empty() {
        return GcSummary::default();
    }
    let avg_gc_cpu_pct =
        snapshots.iter().map(|s| s.gc_cpu_pct).sum::<f64>() / snapshots.len() as f64;
    GcSummary {
        avg_gc_cpu_pct,
        max_gc_cpu_pct: snapshots.iter().map(|s| s.gc_cpu_pct).fold(0.0, f64::max),
        max_runnable_gc_threads: snapshots.iter().map(|s| s.runnable_gc_threads).max().unwrap_or(0),
        max_threads_at_safepoint: snapshots
            .iter()
            .map(|s| s.app_threads_at_safepoint)
            .max()
            .unwrap_or(0),
        potential_stw: snapshots.iter().any(GcSnapshot::suggests_stop_the_world),
        high_gc_cpu: avg_gc_cpu_pct > HIGH_GC_CPU_PCT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::test_support::*;

    fn with_cpu(mut t: ThreadRecord, cpu_ms: f64) -> ThreadRecord {
        t.cpu_time_ms = Some(cpu_ms);
        t
    }

    fn report(result: &AnalysisResult) -> &GcReport {
        match &result.payload {
            ResultPayload::GcActivity(r) => r,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn gc_share_of_cpu() {
        let c = ctx(vec![snapshot(
            0,
            vec![
                with_cpu(thread("GC Thread#0", ThreadState::Runnable), 300.0),
                with_cpu(thread("G1 Conc#0", ThreadState::Runnable), 100.0),
                with_cpu(thread("main", ThreadState::Runnable), 600.0),
            ],
        )]);
        let result = GcActivityAnalyzer.analyze(&c).unwrap();
        let r = report(&result);
        assert_eq!(r.snapshots[0].gc_threads, 2);
        assert_eq!(r.snapshots[0].runnable_gc_threads, 2);
        assert_eq!(r.snapshots[0].gc_cpu_pct, 40.0);
        assert!(r.stats.high_gc_cpu);
        assert_eq!(result.findings[0].category, "gc-high-cpu");
        assert_eq!(
            result.findings[0].message,
            "High GC CPU usage: 40.0% average (max 40.0%)"
        );
        assert_eq!(result.summary(), "GC activity: high CPU usage 40.0% avg");
    }

    #[test]
    fn most_app_threads_halted_suggests_stw() {
        let mut threads: Vec<ThreadRecord> = (0..9)
            .map(|i| thread(&format!("app-{i}"), ThreadState::Blocked))
            .collect();
        threads.push(thread("app-9", ThreadState::Runnable));
        threads.push(thread("GC Thread#0", ThreadState::Runnable));
        let c = ctx(vec![snapshot(0, threads)]);
        let result = GcActivityAnalyzer.analyze(&c).unwrap();
        assert_eq!(
            result.findings[0].message,
            "Potential STW GC pause: 9/10 app threads at safepoint"
        );
        assert_eq!(result.severity, Severity::Warning);
        assert!(result.summary().starts_with("GC activity: potential STW detected"));
    }

    #[test]
    fn quiet_collector_is_ok() {
        let c = ctx(vec![snapshot(
            0,
            vec![
                with_cpu(thread("GC Thread#0", ThreadState::Runnable), 10.0),
                with_cpu(thread("main", ThreadState::Runnable), 990.0),
                thread("timer", ThreadState::TimedWaiting),
            ],
        )]);
        let result = GcActivityAnalyzer.analyze(&c).unwrap();
        assert!(result.findings.is_empty());
        assert_eq!(result.summary(), "GC activity: 1.0% avg CPU");
    }

    #[test]
    fn safepoint_frames_count_even_when_timed_waiting() {
        let t = with_stack(
            thread("app", ThreadState::TimedWaiting),
            &[("SafepointSynchronize", "block")],
        );
        assert!(at_safepoint(&t));
        assert!(!at_safepoint(&thread("app", ThreadState::TimedWaiting)));
        assert!(!at_safepoint(&thread("app", ThreadState::Runnable)));
    }
}
