//! Locks with waiters: who holds them, who queues on them, and for how long.

use std::collections::{BTreeMap, BTreeSet};

use facet::Facet;
use stallscope_types::ThreadRecord;

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::context::CorrelationContext;
use crate::profile::{self, LockContentionSummary};
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};

const HOT_LOCK_WAITERS: usize = 5;
const TRACE_CONTENTION_MS: u64 = 1_000;
const TRACE_HIGH_CONTENTION_MS: u64 = 5_000;
const TRACE_HOT_LOCK_MS: u64 = 500;
const TRACE_HOT_LOCK_LIMIT: usize = 10;

/// One lock with at least one waiter, in one snapshot.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct LockContention {
    pub lock_id: String,
    #[facet(skip_unless_truthy)]
    pub lock_class: Option<String>,
    #[facet(skip_unless_truthy)]
    pub owner: Option<String>,
    pub waiters: Vec<String>,
    pub snapshot_index: usize,
    pub timestamp_ms: i64,
}

impl LockContention {
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn owner_or_unknown(&self) -> &str {
        self.owner.as_deref().unwrap_or("unknown")
    }
}

/// A lock kept by one owner across several snapshots.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct LongHeldLock {
    pub lock_id: String,
    pub owner: String,
    pub snapshots: usize,
    pub total_waiters: usize,
    /// Time between the first and last snapshot the lock was contended in.
    pub held_ms: i64,
}

#[derive(Facet, Clone, Debug, Default, PartialEq)]
pub struct ContentionStats {
    pub contended_locks: usize,
    pub max_waiters: usize,
    pub hot_locks: usize,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct LockContentionReport {
    /// Most waiters first.
    pub contentions: Vec<LockContention>,
    #[facet(default)]
    pub long_held: Vec<LongHeldLock>,
    pub stats: ContentionStats,
    #[facet(skip_unless_truthy)]
    pub trace: Option<LockContentionSummary>,
}

impl LockContentionReport {
    pub fn hot_locks(&self, min_waiters: usize) -> impl Iterator<Item = &LockContention> {
        self.contentions
            .iter()
            .filter(move |c| c.waiter_count() >= min_waiters)
    }

    pub fn summary(&self) -> String {
        let mut out = if self.contentions.is_empty() {
            "No lock contention in dumps".to_string()
        } else {
            format!(
                "Lock contention: {} contended locks, max {} waiters, {} hot locks",
                self.stats.contended_locks, self.stats.max_waiters, self.stats.hot_locks
            )
        };
        if let Some(trace) = &self.trace {
            out.push_str(&format!(
                "; trace: {} events, {}ms blocked",
                trace.total_events, trace.total_blocked_ms
            ));
        }
        out
    }
}

pub struct LockContentionAnalyzer;

impl LockContentionAnalyzer {
    pub const NAME: &'static str = "lock-contention";
}

impl Analyzer for LockContentionAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Detects lock contention issues including hot locks and long-held locks"
    }

    fn priority(&self) -> i32 {
        80
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let mut contentions: Vec<LockContention> = Vec::new();
        for (index, snapshot) in ctx.snapshots().iter().enumerate() {
            contentions.extend(contentions_in(
                &ctx.filtered_threads(snapshot),
                index,
                snapshot.timestamp_ms,
            ));
        }
        contentions.sort_by_key(|c| std::cmp::Reverse(c.waiter_count()));

        let mut findings: Vec<Finding> = contentions
            .iter()
            .filter(|c| c.waiter_count() >= 2)
            .map(|c| {
                Finding::builder(
                    waiter_severity(c.waiter_count()),
                    "lock-contention",
                    format!(
                        "Lock {} held by {} has {} waiting threads",
                        short_lock_id(&c.lock_id),
                        c.owner_or_unknown(),
                        c.waiter_count()
                    ),
                )
                .affected_threads(c.waiters.iter().cloned())
                .detail("lock_id", &c.lock_id)
                .detail("lock_class", &c.lock_class)
                .detail("owner", &c.owner_or_unknown().to_string())
                .detail("waiter_count", &c.waiter_count())
                .detail("snapshot_index", &c.snapshot_index)
                .build()
            })
            .collect();

        let long_held = if ctx.is_multi() && ctx.options().toggles().detect_long_held_locks {
            long_held_locks(
                &contentions,
                ctx,
                ctx.options().thresholds().long_held_lock_threshold_ms,
            )
        } else {
            Vec::new()
        };
        for lock in &long_held {
            findings.push(
                Finding::builder(
                    Severity::Warning,
                    "long-held-lock",
                    format!(
                        "Lock {} held by {} across {} dumps ({} total waiters)",
                        short_lock_id(&lock.lock_id),
                        lock.owner,
                        lock.snapshots,
                        lock.total_waiters
                    ),
                )
                .affected_thread(lock.owner.clone())
                .detail("lock_id", &lock.lock_id)
                .detail("owner", &lock.owner)
                .detail("dump_count", &lock.snapshots)
                .detail("total_waiters", &lock.total_waiters)
                .detail("held_ms", &lock.held_ms)
                .build(),
            );
        }

        let trace = ctx
            .trace_for_range()
            .filter(|data| !data.lock_events.is_empty())
            .map(|data| profile::lock_contention_summary(&data));
        if let Some(summary) = &trace {
            findings.extend(trace_findings(summary));
        }

        let stats = ContentionStats {
            contended_locks: contentions
                .iter()
                .map(|c| c.lock_id.as_str())
                .collect::<BTreeSet<_>>()
                .len(),
            max_waiters: contentions.first().map_or(0, LockContention::waiter_count),
            hot_locks: contentions
                .iter()
                .filter(|c| c.waiter_count() >= HOT_LOCK_WAITERS)
                .map(|c| c.lock_id.as_str())
                .collect::<BTreeSet<_>>()
                .len(),
        };

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::LockContention(LockContentionReport {
                contentions,
                long_held,
                stats,
                trace,
            }),
        ))
    }
}

/// Locks of one snapshot that have waiters, ordered by lock id.
///
/// A lock's owner is the last thread listing it as locked. A thread waits on
/// its waiting-on lock and on every wait-kind lock record, at most once per lock.
pub fn contentions_in(
    threads: &[&ThreadRecord],
    snapshot_index: usize,
    timestamp_ms: i64,
) -> Vec<LockContention> {
    let mut owners: BTreeMap<&str, &ThreadRecord> = BTreeMap::new();
    let mut waiters: BTreeMap<&str, Vec<&ThreadRecord>> = BTreeMap::new();

    for &thread in threads {
        for id in thread.held_locks() {
            owners.insert(id, thread);
        }
        let awaited = thread
            .waiting_on
            .as_deref()
            .into_iter()
            .chain(thread.locks.iter().filter(|l| l.kind.is_wait()).map(|l| l.id.as_str()));
        let mut seen = BTreeSet::new();
        for id in awaited {
            if seen.insert(id) {
                waiters.entry(id).or_default().push(thread);
            }
        }
    }

    waiters
        .into_iter()
        .map(|(id, queue)| {
            let owner = owners.get(id).copied();
            LockContention {
                lock_id: id.to_string(),
                lock_class: lock_class(id, owner, &queue),
                owner: owner.and_then(|t| t.name.clone()),
                waiters: queue
                    .iter()
                    .map(|t| t.name_or_empty().to_string())
                    .collect(),
                snapshot_index,
                timestamp_ms,
            }
        })
        .collect()
}

fn lock_class(id: &str, owner: Option<&ThreadRecord>, waiters: &[&ThreadRecord]) -> Option<String> {
    owner
        .into_iter()
        .chain(waiters.iter().copied())
        .flat_map(|t| t.locks.iter())
        .find(|l| l.id == id && l.class_name.is_some())
        .and_then(|l| l.class_name.clone())
}

/// Locks contended in several snapshots under one unchanged owner, for at
/// least `threshold_ms`.
fn long_held_locks(
    contentions: &[LockContention],
    ctx: &CorrelationContext,
    threshold_ms: u64,
) -> Vec<LongHeldLock> {
    let mut by_lock: BTreeMap<&str, Vec<&LockContention>> = BTreeMap::new();
    for c in contentions {
        by_lock.entry(c.lock_id.as_str()).or_default().push(c);
    }

    by_lock
        .into_iter()
        .filter(|(_, seen)| seen.len() >= 2)
        .filter_map(|(id, seen)| {
            let owners: BTreeSet<&str> = seen.iter().filter_map(|c| c.owner.as_deref()).collect();
            if owners.len() != 1 {
                return None;
            }
            let owner = owners.first()?;
            let first = seen.iter().map(|c| c.snapshot_index).min()?;
            let last = seen.iter().map(|c| c.snapshot_index).max()?;
            let held_ms = ctx.timespan_between(first, last);
            (held_ms >= threshold_ms as i64).then(|| LongHeldLock {
                lock_id: id.to_string(),
                owner: owner.to_string(),
                snapshots: seen.len(),
                total_waiters: seen.iter().map(|c| c.waiter_count()).sum(),
                held_ms,
            })
        })
        .collect()
}

fn trace_findings(summary: &LockContentionSummary) -> Vec<Finding> {
    let mut findings = Vec::new();
    if summary.total_blocked_ms > TRACE_CONTENTION_MS {
        let severity = if summary.total_blocked_ms > TRACE_HIGH_CONTENTION_MS {
            Severity::Warning
        } else {
            Severity::Info
        };
        findings.push(
            Finding::builder(
                severity,
                "jfr-lock-contention",
                format!(
                    "Trace recorded {} lock events with {}ms total blocked time",
                    summary.total_events, summary.total_blocked_ms
                ),
            )
            .detail("total_events", &summary.total_events)
            .detail("unique_locks", &summary.unique_locks)
            .detail("total_blocked_ms", &summary.total_blocked_ms)
            .build(),
        );
    }
    for lock in summary
        .locks
        .iter()
        .take(TRACE_HOT_LOCK_LIMIT)
        .filter(|l| l.total_ms > TRACE_HOT_LOCK_MS)
    {
        findings.push(
            Finding::builder(
                Severity::Info,
                "jfr-hot-lock",
                format!(
                    "Hot lock: {} ({} events, {}ms blocked, max {}ms)",
                    lock.monitor_class, lock.events, lock.total_ms, lock.max_ms
                ),
            )
            .detail("monitor_class", &lock.monitor_class)
            .detail("event_count", &lock.events)
            .detail("total_duration_ms", &lock.total_ms)
            .detail("max_duration_ms", &lock.max_ms)
            .build(),
        );
    }
    findings
}

pub fn waiter_severity(waiters: usize) -> Severity {
    match waiters {
        10.. => Severity::Error,
        5.. => Severity::Warning,
        2.. => Severity::Info,
        _ => Severity::Ok,
    }
}

/// Lock ids longer than ten characters are cut to ten plus an ellipsis.
fn short_lock_id(id: &str) -> String {
    match id.char_indices().nth(10) {
        Some((cut, _)) => format!("{}...", &id[..cut]),
        None => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use stallscope_types::trace::{LockEvent, LockEventKind, TraceData};
    use stallscope_types::{LockKind, LockRecord, Snapshot, ThreadState};

    use super::*;
    use crate::analyzers::test_support::*;
    use crate::options::AnalysisOptions;

    fn owner(name: &str, lock: &str) -> ThreadRecord {
        let mut t = thread(name, ThreadState::Runnable);
        t.locks
            .push(LockRecord::new(lock, LockKind::Locked).of_class("java.lang.Object"));
        t
    }

    fn waiter(name: &str, lock: &str) -> ThreadRecord {
        let mut t = thread(name, ThreadState::Blocked);
        t.waiting_on = Some(lock.to_string());
        t.locks.push(LockRecord::new(lock, LockKind::WaitingToLock));
        t
    }

    fn contended(ts: i64, waiters: usize) -> Snapshot {
        let mut threads = vec![owner("holder", "0x000000076ab2c0f8")];
        threads.extend((0..waiters).map(|i| waiter(&format!("w{i}"), "0x000000076ab2c0f8")));
        snapshot(ts, threads)
    }

    fn report(result: &AnalysisResult) -> &LockContentionReport {
        match &result.payload {
            ResultPayload::LockContention(r) => r,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn waiter_listed_twice_counts_once() {
        let c = ctx(vec![contended(0, 3)]);
        let result = LockContentionAnalyzer.analyze(&c).unwrap();
        let r = report(&result);
        assert_eq!(r.contentions.len(), 1);
        assert_eq!(r.contentions[0].waiter_count(), 3);
        assert_eq!(r.contentions[0].lock_class.as_deref(), Some("java.lang.Object"));
        assert_eq!(
            result.findings[0].message,
            "Lock 0x00000007... held by holder has 3 waiting threads"
        );
        assert_eq!(result.severity, Severity::Info);
    }

    #[test]
    fn severity_by_waiters() {
        assert_eq!(waiter_severity(1), Severity::Ok);
        assert_eq!(waiter_severity(2), Severity::Info);
        assert_eq!(waiter_severity(5), Severity::Warning);
        assert_eq!(waiter_severity(10), Severity::Error);
    }

    #[test]
    fn same_owner_over_threshold_is_long_held() {
        let c = ctx(vec![contended(0, 2), contended(6_000, 5)]);
        let result = LockContentionAnalyzer.analyze(&c).unwrap();
        let r = report(&result);
        assert_eq!(r.long_held.len(), 1);
        assert_eq!(r.long_held[0].total_waiters, 7);
        assert_eq!(r.long_held[0].held_ms, 6_000);
        assert_eq!(r.stats.max_waiters, 5);
        assert_eq!(r.stats.hot_locks, 1);
        assert_eq!(r.stats.contended_locks, 1);
        assert!(
            result
                .findings
                .iter()
                .any(|f| f.message == "Lock 0x00000007... held by holder across 2 dumps (7 total waiters)")
        );
    }

    #[test]
    fn short_hold_or_disabled_toggle_is_not_long_held() {
        let c = ctx(vec![contended(0, 2), contended(1_000, 2)]);
        let result = LockContentionAnalyzer.analyze(&c).unwrap();
        assert!(report(&result).long_held.is_empty());

        let opts = AnalysisOptions::builder()
            .detect_long_held_locks(false)
            .build()
            .unwrap();
        let c = ctx_with(vec![contended(0, 2), contended(9_000, 2)], opts);
        let result = LockContentionAnalyzer.analyze(&c).unwrap();
        assert!(report(&result).long_held.is_empty());
    }

    #[test]
    fn trace_lock_events_add_findings() {
        let event = |ts: i64, duration_ms: u64| LockEvent {
            timestamp_ms: ts,
            thread_name: Some("w0".to_string()),
            monitor_class: Some("com.acme.Cache".to_string()),
            duration_ms,
            previous_owner: None,
            kind: LockEventKind::Enter,
        };
        let data = TraceData {
            lock_events: vec![event(100, 4_000), event(200, 2_500)],
            ..TraceData::default()
        };
        let c = ctx_with_trace(vec![contended(0, 0)], data);
        let result = LockContentionAnalyzer.analyze(&c).unwrap();
        let categories: Vec<&str> = result.findings.iter().map(|f| f.category.as_str()).collect();
        assert_eq!(categories, vec!["jfr-lock-contention", "jfr-hot-lock"]);
        assert_eq!(result.severity, Severity::Warning);
        assert_eq!(
            result.summary(),
            "No lock contention in dumps; trace: 2 events, 6500ms blocked"
        );
    }

    #[test]
    fn short_ids_are_kept() {
        assert_eq!(short_lock_id("0x1"), "0x1");
        assert_eq!(short_lock_id("0123456789"), "0123456789");
        assert_eq!(short_lock_id("0123456789a"), "0123456789...");
    }
}
