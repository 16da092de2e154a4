//! Deadlock detection: runtime-reported cycles plus a heuristic search over
//! the lock-wait graph, followed by persistence analysis across snapshots.
//!
//! The lock-wait graph is implicit: a BLOCKED thread points at the lock it
//! awaits, and a lock points at the thread holding it. A path that revisits
//! a thread is a cycle. Reported cycles are authoritative (CRITICAL);
//! heuristic cycles rank one level lower (ERROR).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use facet::Facet;
use stallscope_types::{LockKind, Snapshot, ThreadRecord, ThreadState};

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::context::CorrelationContext;
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};

// ── Payload ─────────────────────────────────────────────────────

/// One cycle observed in one snapshot.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct DetectedDeadlock {
    /// Thread names in wait order.
    pub threads: Vec<String>,
    /// Lock ids awaited along the cycle.
    #[facet(default)]
    pub locks: Vec<String>,
    pub snapshot_index: usize,
    pub timestamp_ms: i64,
    /// Self-reported by the runtime, as opposed to found by search.
    pub reported: bool,
}

impl DetectedDeadlock {
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Sorted, pipe-joined thread names.
    pub fn signature(&self) -> String {
        let mut names: Vec<&str> = self.threads.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.join("|")
    }

    fn name_set(&self) -> BTreeSet<&str> {
        self.threads.iter().map(String::as_str).collect()
    }
}

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum SignatureStatus {
    /// Not present in the final snapshot.
    Resolved,
    /// Seen repeatedly and still present at the end.
    OngoingCritical,
    /// First seen after the first snapshot.
    Appeared,
    Transient,
}

impl SignatureStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Resolved => "RESOLVED",
            Self::OngoingCritical => "ONGOING CRITICAL",
            Self::Appeared => "APPEARED",
            Self::Transient => "TRANSIENT",
        }
    }
}

/// History of one deadlock signature across the run.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct SignaturePersistence {
    pub signature: String,
    pub first_seen: usize,
    pub last_seen: usize,
    pub occurrences: usize,
    /// Occurred more than once.
    pub persistent: bool,
    pub status: SignatureStatus,
}

impl SignaturePersistence {
    pub fn is_ongoing(&self) -> bool {
        self.last_seen > self.first_seen
    }

    pub fn span(&self) -> usize {
        self.last_seen - self.first_seen + 1
    }
}

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum SnapshotDeadlockStatus {
    Clear,
    Present,
    Appeared,
    Resolved,
    Worsening,
    Improving,
    Persistent,
}

impl SnapshotDeadlockStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Clear => "CLEAR",
            Self::Present => "PRESENT",
            Self::Appeared => "APPEARED",
            Self::Resolved => "RESOLVED",
            Self::Worsening => "WORSENING",
            Self::Improving => "IMPROVING",
            Self::Persistent => "PERSISTENT",
        }
    }
}

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum DeadlockTrend {
    AllClear,
    AlwaysPresent,
    ImprovingResolved,
    DegradingNewDeadlock,
    Intermittent,
}

impl DeadlockTrend {
    pub fn label(self) -> &'static str {
        match self {
            Self::AllClear => "ALL CLEAR",
            Self::AlwaysPresent => "ALWAYS PRESENT",
            Self::ImprovingResolved => "IMPROVING - RESOLVED",
            Self::DegradingNewDeadlock => "DEGRADING - NEW DEADLOCK",
            Self::Intermittent => "INTERMITTENT",
        }
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct SnapshotDeadlocks {
    pub snapshot_index: usize,
    pub count: usize,
    pub status: SnapshotDeadlockStatus,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct DeadlockPersistence {
    pub signatures: Vec<SignaturePersistence>,
    pub per_snapshot: Vec<SnapshotDeadlocks>,
    pub trend: DeadlockTrend,
}

impl DeadlockPersistence {
    pub fn has_persistent(&self) -> bool {
        self.signatures.iter().any(|s| s.persistent)
    }

    pub fn max_occurrences(&self) -> usize {
        self.signatures
            .iter()
            .map(|s| s.occurrences)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct DeadlockReport {
    pub deadlocks: Vec<DetectedDeadlock>,
    /// Only for multi-snapshot runs with at least one deadlock.
    #[facet(skip_unless_truthy)]
    pub persistence: Option<DeadlockPersistence>,
    pub total: usize,
    pub reported: usize,
    pub max_cycle_size: usize,
}

impl DeadlockReport {
    pub fn has_deadlocks(&self) -> bool {
        !self.deadlocks.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.deadlocks.is_empty() {
            return "No deadlocks detected".to_string();
        }
        format!(
            "DEADLOCK: {} deadlock(s) detected, max cycle size {}",
            self.total, self.max_cycle_size
        )
    }
}

// ── Analyzer ────────────────────────────────────────────────────

pub struct DeadlockAnalyzer;

impl DeadlockAnalyzer {
    pub const NAME: &'static str = "deadlock";
}

impl Analyzer for DeadlockAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Detects deadlocks using runtime reports and lock graph analysis"
    }

    fn priority(&self) -> i32 {
        200
    }

    fn can_analyze(&self, ctx: &CorrelationContext) -> bool {
        ctx.options().toggles().detect_deadlocks
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let mut deadlocks: Vec<DetectedDeadlock> = Vec::new();
        let mut findings: Vec<Finding> = Vec::new();

        for (index, snapshot) in ctx.snapshots().iter().enumerate() {
            let before = deadlocks.len();

            for reported in &snapshot.reported_deadlocks {
                let threads: Vec<String> = reported
                    .threads
                    .iter()
                    .map(|t| t.thread_name.clone())
                    .collect();
                findings.push(
                    Finding::builder(
                        Severity::Critical,
                        "deadlock",
                        format!(
                            "Deadlock detected involving {} threads: {}",
                            threads.len(),
                            threads.join(", ")
                        ),
                    )
                    .affected_threads(threads.iter().cloned())
                    .detail("snapshot_index", &index)
                    .detail("thread_count", &threads.len())
                    .build(),
                );
                deadlocks.push(DetectedDeadlock {
                    locks: reported
                        .threads
                        .iter()
                        .filter_map(|t| t.waiting_for_object.clone())
                        .collect(),
                    threads,
                    snapshot_index: index,
                    timestamp_ms: snapshot.timestamp_ms,
                    reported: true,
                });
            }

            let filtered = ctx.filtered_threads(snapshot);
            for cycle in find_lock_cycles(&filtered) {
                let names: BTreeSet<&str> = cycle.threads.iter().map(String::as_str).collect();
                if deadlocks[before..].iter().any(|d| d.name_set() == names) {
                    continue;
                }
                findings.push(
                    Finding::builder(
                        Severity::Error,
                        "potential-deadlock",
                        format!(
                            "Potential lock cycle detected: {}",
                            cycle.threads.join(" → ")
                        ),
                    )
                    .affected_threads(cycle.threads.iter().cloned())
                    .detail("snapshot_index", &index)
                    .detail("cycle_size", &cycle.threads.len())
                    .build(),
                );
                deadlocks.push(DetectedDeadlock {
                    threads: cycle.threads,
                    locks: cycle.locks,
                    snapshot_index: index,
                    timestamp_ms: snapshot.timestamp_ms,
                    reported: false,
                });
            }
        }

        let persistence = if ctx.is_multi() && !deadlocks.is_empty() {
            let persistence = analyze_persistence(&deadlocks, ctx.snapshot_count());
            for sig in persistence.signatures.iter().filter(|s| s.persistent) {
                findings.push(
                    Finding::builder(
                        Severity::Critical,
                        "persistent-deadlock",
                        format!(
                            "Deadlock persisted across {} dumps: {}",
                            sig.occurrences,
                            sig.signature.replace('|', ", ")
                        ),
                    )
                    .affected_threads(sig.signature.split('|'))
                    .detail("occurrences", &sig.occurrences)
                    .detail("first_seen", &sig.first_seen)
                    .detail("last_seen", &sig.last_seen)
                    .build(),
                );
            }
            Some(persistence)
        } else {
            None
        };

        let report = DeadlockReport {
            total: deadlocks.len(),
            reported: deadlocks.iter().filter(|d| d.reported).count(),
            max_cycle_size: deadlocks.iter().map(DetectedDeadlock::size).max().unwrap_or(0),
            deadlocks,
            persistence,
        };
        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::Deadlock(report),
        ))
    }
}

// ── Cycle search ────────────────────────────────────────────────

/// A cycle in the lock-wait graph of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockCycle {
    pub threads: Vec<String>,
    pub locks: Vec<String>,
}

struct WaitGraph<'a> {
    /// Thread name -> lock id it waits for (BLOCKED threads only).
    waits_for: HashMap<&'a str, &'a str>,
    /// Lock id -> name of the thread holding it.
    held_by: HashMap<&'a str, &'a str>,
}

impl<'a> WaitGraph<'a> {
    fn build(threads: &[&'a ThreadRecord]) -> Self {
        let mut waits_for = HashMap::new();
        let mut held_by = HashMap::new();
        for thread in threads {
            let Some(name) = thread.name.as_deref() else {
                continue;
            };
            for lock in thread.locks.iter().filter(|l| l.kind == LockKind::Locked) {
                held_by.insert(lock.id.as_str(), name);
            }
            if thread.is_in(ThreadState::Blocked)
                && let Some(lock) = thread.awaited_lock()
            {
                waits_for.insert(name, lock);
            }
        }
        Self { waits_for, held_by }
    }

    fn next(&self, thread: &str) -> Option<(&'a str, &'a str)> {
        let lock = self.waits_for.get(thread)?;
        let holder = self.held_by.get(lock)?;
        Some((lock, holder))
    }
}

/// Follows each BLOCKED thread's wait chain; a chain that returns to a
/// thread already on it is a cycle, trimmed to start at that thread.
/// The same cycle found from different start threads is reported once.
pub fn find_lock_cycles(threads: &[&ThreadRecord]) -> Vec<LockCycle> {
    let graph = WaitGraph::build(threads);
    let mut cycles: Vec<LockCycle> = Vec::new();
    let mut seen: HashSet<BTreeSet<String>> = HashSet::new();

    for start in threads {
        if !start.is_in(ThreadState::Blocked) {
            continue;
        }
        let Some(start_name) = start.name.as_deref() else {
            continue;
        };

        let mut path: Vec<&str> = vec![start_name];
        let mut locks: Vec<&str> = Vec::new();
        let mut current = start_name;
        while let Some((lock, holder)) = graph.next(current) {
            locks.push(lock);
            if let Some(pos) = path.iter().position(|t| *t == holder) {
                let cycle = LockCycle {
                    threads: path[pos..].iter().map(|t| t.to_string()).collect(),
                    locks: locks[pos..].iter().map(|l| l.to_string()).collect(),
                };
                let key: BTreeSet<String> = cycle.threads.iter().cloned().collect();
                if seen.insert(key) {
                    cycles.push(cycle);
                }
                break;
            }
            path.push(holder);
            current = holder;
        }
    }
    cycles
}

// ── Persistence ─────────────────────────────────────────────────

fn analyze_persistence(deadlocks: &[DetectedDeadlock], snapshot_count: usize) -> DeadlockPersistence {
    let last_index = snapshot_count.saturating_sub(1);

    // Signature -> snapshot indices, in first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for d in deadlocks {
        let sig = d.signature();
        groups
            .entry(sig.clone())
            .or_insert_with(|| {
                order.push(sig);
                Vec::new()
            })
            .push(d.snapshot_index);
    }

    let signatures = order
        .into_iter()
        .filter_map(|signature| {
            let indices = groups.remove(&signature)?;
            let first_seen = indices.iter().copied().min()?;
            let last_seen = indices.iter().copied().max()?;
            let persistent = indices.len() > 1;
            let status = if last_seen < last_index {
                SignatureStatus::Resolved
            } else if persistent && last_seen > first_seen {
                SignatureStatus::OngoingCritical
            } else if first_seen > 0 {
                SignatureStatus::Appeared
            } else {
                SignatureStatus::Transient
            };
            Some(SignaturePersistence {
                signature,
                first_seen,
                last_seen,
                occurrences: indices.len(),
                persistent,
                status,
            })
        })
        .collect();

    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for d in deadlocks {
        *counts.entry(d.snapshot_index).or_default() += 1;
    }
    let per_snapshot: Vec<SnapshotDeadlocks> = (0..snapshot_count)
        .map(|i| {
            let count = counts.get(&i).copied().unwrap_or(0);
            let prev = if i > 0 {
                Some(counts.get(&(i - 1)).copied().unwrap_or(0))
            } else {
                None
            };
            let status = match (prev, count) {
                (Some(p), 0) if p > 0 => SnapshotDeadlockStatus::Resolved,
                (_, 0) => SnapshotDeadlockStatus::Clear,
                (None, _) => SnapshotDeadlockStatus::Present,
                (Some(0), _) => SnapshotDeadlockStatus::Appeared,
                (Some(p), c) if c > p => SnapshotDeadlockStatus::Worsening,
                (Some(p), c) if c < p => SnapshotDeadlockStatus::Improving,
                _ => SnapshotDeadlockStatus::Persistent,
            };
            SnapshotDeadlocks {
                snapshot_index: i,
                count,
                status,
            }
        })
        .collect();

    let with_deadlocks: Vec<usize> = per_snapshot
        .iter()
        .filter(|s| s.count > 0)
        .map(|s| s.snapshot_index)
        .collect();
    let trend = match (with_deadlocks.first(), with_deadlocks.last()) {
        (None, _) | (_, None) => DeadlockTrend::AllClear,
        _ if with_deadlocks.len() == snapshot_count => DeadlockTrend::AlwaysPresent,
        (_, Some(&last)) if last < last_index => DeadlockTrend::ImprovingResolved,
        (Some(&first), _) if first > 0 => DeadlockTrend::DegradingNewDeadlock,
        _ => DeadlockTrend::Intermittent,
    };

    DeadlockPersistence {
        signatures,
        per_snapshot,
        trend,
    }
}

/// Names of every thread the runtime itself reported as deadlocked.
pub fn reported_thread_names(snapshot: &Snapshot) -> Vec<&str> {
    snapshot
        .reported_deadlocks
        .iter()
        .flat_map(|d| d.thread_names())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::test_support::*;
    use crate::options::AnalysisOptions;
    use stallscope_types::{DeadlockedThread, LockRecord, ReportedDeadlock};

    fn blocked(name: &str, holds: &str, waits: &str) -> ThreadRecord {
        ThreadRecord {
            locks: vec![
                LockRecord::new(waits, LockKind::WaitingToLock),
                LockRecord::new(holds, LockKind::Locked),
            ],
            ..thread(name, ThreadState::Blocked)
        }
    }

    fn two_way() -> Vec<ThreadRecord> {
        vec![
            blocked("Worker-1", "0x2", "0x1"),
            blocked("Worker-2", "0x1", "0x2"),
        ]
    }

    fn report(result: &AnalysisResult) -> &DeadlockReport {
        match &result.payload {
            ResultPayload::Deadlock(r) => r,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn two_thread_cycle_is_found_once_from_either_start() {
        let threads = two_way();
        let refs: Vec<&ThreadRecord> = threads.iter().collect();
        let cycles = find_lock_cycles(&refs);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].threads, vec!["Worker-1", "Worker-2"]);
        assert_eq!(cycles[0].locks, vec!["0x1", "0x2"]);

        let reversed: Vec<&ThreadRecord> = threads.iter().rev().collect();
        let cycles = find_lock_cycles(&reversed);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].threads, vec!["Worker-2", "Worker-1"]);
    }

    #[test]
    fn acyclic_prefix_is_dropped() {
        let mut threads = two_way();
        threads.push(blocked("Tail", "0x9", "0x2"));
        let refs: Vec<&ThreadRecord> = threads.iter().rev().collect();
        let cycles = find_lock_cycles(&refs);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].threads.len(), 2);
        assert!(!cycles[0].threads.contains(&"Tail".to_string()));
    }

    #[test]
    fn waiting_on_field_counts_as_an_edge() {
        let a = ThreadRecord {
            waiting_on: Some("0x1".to_string()),
            locks: vec![LockRecord::new("0x2", LockKind::Locked)],
            ..thread("a", ThreadState::Blocked)
        };
        let b = ThreadRecord {
            waiting_on: Some("0x2".to_string()),
            locks: vec![LockRecord::new("0x1", LockKind::Locked)],
            ..thread("b", ThreadState::Blocked)
        };
        assert_eq!(find_lock_cycles(&[&a, &b]).len(), 1);
    }

    #[test]
    fn chain_without_cycle_is_ignored() {
        let a = blocked("a", "0x2", "0x1");
        let holder = ThreadRecord {
            locks: vec![LockRecord::new("0x1", LockKind::Locked)],
            ..thread("holder", ThreadState::Runnable)
        };
        assert!(find_lock_cycles(&[&a, &holder]).is_empty());
    }

    #[test]
    fn reported_deadlock_suppresses_identical_heuristic_cycle() {
        let deadlock = ReportedDeadlock {
            threads: vec![
                DeadlockedThread::named("Worker-1"),
                DeadlockedThread::named("Worker-2"),
            ],
        };
        let c = ctx(vec![
            snapshot(0, two_way()).with_reported_deadlocks(vec![deadlock]),
        ]);
        let result = DeadlockAnalyzer.analyze(&c).unwrap();
        assert_eq!(result.severity, Severity::Critical);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].category, "deadlock");
        let report = report(&result);
        assert_eq!(report.total, 1);
        assert_eq!(report.reported, 1);
        assert!(report.persistence.is_none());
    }

    #[test]
    fn heuristic_cycle_is_error() {
        let c = ctx(vec![snapshot(0, two_way())]);
        let result = DeadlockAnalyzer.analyze(&c).unwrap();
        assert_eq!(result.severity, Severity::Error);
        assert_eq!(result.findings[0].category, "potential-deadlock");
        assert_eq!(
            result.findings[0].message,
            "Potential lock cycle detected: Worker-1 → Worker-2"
        );
    }

    #[test]
    fn persistent_across_three_snapshots() {
        let c = ctx(vec![
            snapshot(0, two_way()),
            snapshot(1_000, two_way()),
            snapshot(2_000, two_way()),
        ]);
        let result = DeadlockAnalyzer.analyze(&c).unwrap();
        let report = report(&result);
        let persistence = report.persistence.as_ref().unwrap();
        assert_eq!(persistence.signatures.len(), 1);
        let sig = &persistence.signatures[0];
        assert_eq!(sig.signature, "Worker-1|Worker-2");
        assert_eq!(sig.occurrences, 3);
        assert_eq!(sig.first_seen, 0);
        assert_eq!(sig.last_seen, 2);
        assert_eq!(sig.status, SignatureStatus::OngoingCritical);
        assert_eq!(persistence.trend, DeadlockTrend::AlwaysPresent);
        assert_eq!(persistence.trend.label(), "ALWAYS PRESENT");
        assert_eq!(result.severity, Severity::Critical);
        assert!(result.findings.iter().any(|f| f.category == "persistent-deadlock"));
    }

    #[test]
    fn resolved_and_appeared() {
        let c = ctx(vec![
            snapshot(0, two_way()),
            snapshot(1_000, Vec::new()),
        ]);
        let result = DeadlockAnalyzer.analyze(&c).unwrap();
        let persistence = report(&result).persistence.clone().unwrap();
        assert_eq!(persistence.signatures[0].status, SignatureStatus::Resolved);
        assert_eq!(persistence.trend, DeadlockTrend::ImprovingResolved);
        let statuses: Vec<SnapshotDeadlockStatus> =
            persistence.per_snapshot.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                SnapshotDeadlockStatus::Present,
                SnapshotDeadlockStatus::Resolved
            ]
        );

        let c = ctx(vec![
            snapshot(0, Vec::new()),
            snapshot(1_000, two_way()),
        ]);
        let result = DeadlockAnalyzer.analyze(&c).unwrap();
        let persistence = report(&result).persistence.clone().unwrap();
        assert_eq!(persistence.signatures[0].status, SignatureStatus::Appeared);
        assert_eq!(persistence.trend, DeadlockTrend::DegradingNewDeadlock);
        assert_eq!(
            persistence.per_snapshot[1].status,
            SnapshotDeadlockStatus::Appeared
        );
    }

    #[test]
    fn toggle_disables_detector() {
        let opts = AnalysisOptions::builder()
            .detect_deadlocks(false)
            .build()
            .unwrap();
        let c = ctx_with(vec![snapshot(0, two_way())], opts);
        assert!(!DeadlockAnalyzer.can_analyze(&c));
    }
}
