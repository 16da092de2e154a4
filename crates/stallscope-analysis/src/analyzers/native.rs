//! Threads executing native methods and the native-interface reference counts.

use std::collections::BTreeSet;

use facet::Facet;
use stallscope_types::{Snapshot, ThreadRecord, ThreadState};

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::context::CorrelationContext;
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};

const GROWTH_FACTOR: f64 = 1.5;
const GROWTH_MIN_REFS: u64 = 100;
const HIGH_NATIVE_THREADS: usize = 20;
const STUCK_NATIVE_THREADS: usize = 3;

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct NativeThread {
    pub name: String,
    #[facet(skip_unless_truthy)]
    pub native_id: Option<u64>,
    /// Innermost native frame, as `SimpleClass.method`.
    pub top_native_method: String,
    #[facet(skip_unless_truthy)]
    pub state: Option<ThreadState>,
}

impl NativeThread {
    fn key(&self) -> String {
        format!("{}@{}", self.name, self.top_native_method)
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct NativeSnapshot {
    pub snapshot_index: usize,
    pub timestamp_ms: i64,
    pub has_resource_info: bool,
    pub global_refs: u64,
    pub weak_refs: u64,
    pub threads: Vec<NativeThread>,
}

#[derive(Facet, Clone, Debug, Default, PartialEq)]
pub struct NativeStats {
    pub max_native_threads: usize,
    pub max_global_refs: u64,
    pub max_weak_refs: u64,
    pub global_refs_growing: bool,
    pub high_native_threads: bool,
    pub stuck_native_threads: bool,
}

impl NativeStats {
    pub fn has_issues(&self) -> bool {
        self.global_refs_growing || self.stuck_native_threads
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct NativeReport {
    pub snapshots: Vec<NativeSnapshot>,
    pub stats: NativeStats,
}

impl NativeReport {
    pub fn summary(&self) -> String {
        let mut out = format!("{} native threads", self.stats.max_native_threads);
        if self.stats.max_global_refs > 0 {
            out.push_str(&format!(", {} global refs", self.stats.max_global_refs));
        }
        if self.stats.has_issues() {
            out.push_str(" (issues detected)");
        }
        out
    }
}

pub struct NativeResourceAnalyzer;

impl NativeResourceAnalyzer {
    pub const NAME: &'static str = "native-resource";
}

impl Analyzer for NativeResourceAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Analyzes JNI resource usage, native method calls, and potential native issues"
    }

    fn priority(&self) -> i32 {
        35
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let snapshots: Vec<NativeSnapshot> = ctx
            .snapshots()
            .iter()
            .enumerate()
            .map(|(index, snapshot)| measure(index, snapshot, &ctx.filtered_threads(snapshot)))
            .collect();

        let mut findings = Vec::new();
        let mut stats = NativeStats {
            max_native_threads: snapshots.iter().map(|s| s.threads.len()).max().unwrap_or(0),
            max_global_refs: snapshots.iter().map(|s| s.global_refs).max().unwrap_or(0),
            max_weak_refs: snapshots.iter().map(|s| s.weak_refs).max().unwrap_or(0),
            ..NativeStats::default()
        };

        if let [first, .., last] = snapshots.as_slice() {
            let (from, to) = (first.global_refs, last.global_refs);
            if to as f64 > from as f64 * GROWTH_FACTOR && to.saturating_sub(from) > GROWTH_MIN_REFS {
                stats.global_refs_growing = true;
                findings.push(
                    Finding::builder(
                        Severity::Warning,
                        "jni-global-refs-growing",
                        format!("JNI global refs growing: {from} → {to}"),
                    )
                    .detail("first", &from)
                    .detail("last", &to)
                    .build(),
                );
            }
        }

        if stats.max_native_threads > HIGH_NATIVE_THREADS {
            stats.high_native_threads = true;
            findings.push(
                Finding::builder(
                    Severity::Info,
                    "jni-high-native-threads",
                    format!("{} threads executing native methods", stats.max_native_threads),
                )
                .detail("count", &stats.max_native_threads)
                .build(),
            );
        }

        if let [first, .., last] = snapshots.as_slice() {
            let before: BTreeSet<String> = first.threads.iter().map(NativeThread::key).collect();
            let stuck: Vec<&NativeThread> = last
                .threads
                .iter()
                .filter(|t| before.contains(&t.key()))
                .collect();
            if stuck.len() >= STUCK_NATIVE_THREADS {
                stats.stuck_native_threads = true;
                findings.push(
                    Finding::builder(
                        Severity::Warning,
                        "jni-stuck-native-threads",
                        format!(
                            "{} threads stuck in same native method across dumps",
                            stuck.len()
                        ),
                    )
                    .affected_threads(stuck.iter().map(|t| t.name.clone()))
                    .detail("count", &stuck.len())
                    .build(),
                );
            }
        }

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::NativeResource(NativeReport { snapshots, stats }),
        ))
    }
}

fn native_thread(thread: &ThreadRecord) -> Option<NativeThread> {
    let frame = thread.stack.iter().find(|f| f.native)?;
    Some(NativeThread {
        name: thread.name_or_empty().to_string(),
        native_id: thread.native_id,
        top_native_method: frame.short_method(),
        state: thread.state,
    })
}

fn measure(index: usize, snapshot: &Snapshot, threads: &[&ThreadRecord]) -> NativeSnapshot {
    let resources = snapshot.native_resources.as_ref();
    NativeSnapshot {
        snapshot_index: index,
        timestamp_ms: snapshot.timestamp_ms,
        has_resource_info: resources.is_some(),
        global_refs: resources.and_then(|r| r.global_refs).unwrap_or(0),
        weak_refs: resources.and_then(|r| r.weak_refs).unwrap_or(0),
        threads: threads.iter().filter_map(|t| native_thread(t)).collect(),
    }
}
