//! The correlated, filtered view over an ordered run of snapshots.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use facet::Facet;
use stallscope_types::trace::TraceData;
use stallscope_types::{Snapshot, ThreadRecord, ThreadState};
use tracing::{info, warn};

use crate::identity::{self, ThreadIdentity};
use crate::options::AnalysisOptions;
use crate::trace::TraceSource;

/// Trace window around the whole snapshot range.
const RANGE_TRACE_MARGIN_MS: i64 = 5_000;
/// Trace window around a single snapshot.
const SNAPSHOT_TRACE_MARGIN_MS: i64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    NoSnapshots,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSnapshots => f.write_str("At least one thread dump is required"),
        }
    }
}

impl std::error::Error for ContextError {}

// ── Derived views ───────────────────────────────────────────────

/// One logical thread across every snapshot: slot `i` holds the record seen
/// in snapshot `i`, or `None` when the thread was absent there.
#[derive(Debug, Clone)]
pub struct ThreadHistory<'a> {
    pub identity: ThreadIdentity,
    pub occurrences: Vec<Option<&'a ThreadRecord>>,
}

impl<'a> ThreadHistory<'a> {
    pub fn present(&self) -> impl Iterator<Item = (usize, &'a ThreadRecord)> + '_ {
        self.occurrences
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.map(|t| (i, t)))
    }

    pub fn first_present(&self) -> Option<(usize, &'a ThreadRecord)> {
        self.present().next()
    }

    pub fn last_present(&self) -> Option<(usize, &'a ThreadRecord)> {
        self.present().last()
    }

    pub fn present_count(&self) -> usize {
        self.occurrences.iter().filter(|t| t.is_some()).count()
    }
}

/// Lifecycle summary of one thread over the run.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct ThreadEvolution {
    pub identity: ThreadIdentity,
    pub states: Vec<Option<ThreadState>>,
    pub first_seen: usize,
    pub last_seen: usize,
    /// Absent from the first snapshot.
    pub appeared_newly: bool,
    /// Absent from the last snapshot.
    pub disappeared: bool,
    pub state_changed: bool,
    #[facet(skip_unless_truthy)]
    pub most_common_state: Option<ThreadState>,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct StateChange {
    pub identity: ThreadIdentity,
    #[facet(skip_unless_truthy)]
    pub from: Option<ThreadState>,
    #[facet(skip_unless_truthy)]
    pub to: Option<ThreadState>,
}

/// What changed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct SnapshotChanges {
    pub appeared: Vec<ThreadIdentity>,
    pub disappeared: Vec<ThreadIdentity>,
    pub state_changes: Vec<StateChange>,
}

/// Location of a thread record: (snapshot index, thread index).
pub type ThreadLocation = (usize, usize);

/// Lookup tables over every thread of every snapshot.
#[derive(Debug, Default)]
pub struct ThreadIndices {
    pub by_native_id: HashMap<u64, Vec<ThreadLocation>>,
    pub by_logical_id: HashMap<u64, Vec<ThreadLocation>>,
    pub by_name: HashMap<String, Vec<ThreadLocation>>,
}

struct MatchedSlots {
    identity: ThreadIdentity,
    slots: Vec<Option<usize>>,
}

// ── Context ─────────────────────────────────────────────────────

/// Owns the snapshots of one analysis run, plus the options and an optional
/// trace source. Derived indices are computed once on first use; the
/// snapshots never change after construction, so the caches never go stale.
pub struct CorrelationContext {
    snapshots: Vec<Snapshot>,
    options: AnalysisOptions,
    trace_source: Option<Box<dyn TraceSource>>,
    /// Set on the first trace request and never retried.
    trace: OnceLock<Option<TraceData>>,
    matched: OnceLock<Vec<MatchedSlots>>,
    indices: OnceLock<ThreadIndices>,
    evolutions: OnceLock<Vec<ThreadEvolution>>,
}

impl fmt::Debug for CorrelationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationContext")
            .field("snapshots", &self.snapshots.len())
            .field("options", &self.options)
            .field("has_trace_source", &self.trace_source.is_some())
            .field("trace_loaded", &self.trace.get().is_some())
            .finish()
    }
}

impl CorrelationContext {
    pub fn new(snapshots: Vec<Snapshot>, options: AnalysisOptions) -> Result<Self, ContextError> {
        if snapshots.is_empty() {
            return Err(ContextError::NoSnapshots);
        }
        Ok(Self {
            snapshots,
            options,
            trace_source: None,
            trace: OnceLock::new(),
            matched: OnceLock::new(),
            indices: OnceLock::new(),
            evolutions: OnceLock::new(),
        })
    }

    pub fn single(snapshot: Snapshot, options: AnalysisOptions) -> Self {
        Self {
            snapshots: vec![snapshot],
            options,
            trace_source: None,
            trace: OnceLock::new(),
            matched: OnceLock::new(),
            indices: OnceLock::new(),
            evolutions: OnceLock::new(),
        }
    }

    pub fn multi(snapshots: Vec<Snapshot>, options: AnalysisOptions) -> Result<Self, ContextError> {
        Self::new(snapshots, options)
    }

    pub fn with_trace(
        snapshots: Vec<Snapshot>,
        trace: Box<dyn TraceSource>,
        options: AnalysisOptions,
    ) -> Result<Self, ContextError> {
        let mut ctx = Self::new(snapshots, options)?;
        ctx.trace_source = Some(trace);
        Ok(ctx)
    }

    // ── Basic accessors ─────────────────────────────────────────

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn snapshot(&self, index: usize) -> Option<&Snapshot> {
        self.snapshots.get(index)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_multi(&self) -> bool {
        self.snapshots.len() > 1
    }

    pub fn first(&self) -> &Snapshot {
        &self.snapshots[0]
    }

    pub fn last(&self) -> &Snapshot {
        &self.snapshots[self.snapshots.len() - 1]
    }

    pub fn options(&self) -> &AnalysisOptions {
        &self.options
    }

    /// Milliseconds between the first and the last snapshot.
    pub fn time_span_ms(&self) -> i64 {
        self.last().timestamp_ms - self.first().timestamp_ms
    }

    /// Milliseconds from snapshot `from` to snapshot `to`; zero when either
    /// index is out of range or `from > to`.
    pub fn timespan_between(&self, from: usize, to: usize) -> i64 {
        match (self.snapshots.get(from), self.snapshots.get(to)) {
            (Some(a), Some(b)) if from <= to => b.timestamp_ms - a.timestamp_ms,
            _ => 0,
        }
    }

    // ── Filtering ───────────────────────────────────────────────

    pub fn accepts(&self, thread: &ThreadRecord) -> bool {
        self.options.accepts(thread)
    }

    pub fn filtered_threads<'a>(&self, snapshot: &'a Snapshot) -> Vec<&'a ThreadRecord> {
        snapshot
            .threads
            .iter()
            .filter(|t| self.options.accepts(t))
            .collect()
    }

    pub fn filtered_threads_at(&self, index: usize) -> Vec<&ThreadRecord> {
        self.snapshots
            .get(index)
            .map(|s| self.filtered_threads(s))
            .unwrap_or_default()
    }

    // ── Identity matching ───────────────────────────────────────

    pub fn match_thread<'a>(
        &self,
        thread: &ThreadRecord,
        target: &'a Snapshot,
    ) -> Option<&'a ThreadRecord> {
        identity::match_thread(thread, target)
    }

    /// Every distinct thread identity with one slot per snapshot.
    ///
    /// Ordered by first appearance. When two records of the same snapshot
    /// resolve to one identity, the later record wins the slot.
    pub fn matched_threads(&self) -> Vec<ThreadHistory<'_>> {
        self.matched
            .get_or_init(|| self.build_matched())
            .iter()
            .map(|m| ThreadHistory {
                identity: m.identity.clone(),
                occurrences: m
                    .slots
                    .iter()
                    .enumerate()
                    .map(|(snap, slot)| slot.map(|t| &self.snapshots[snap].threads[t]))
                    .collect(),
            })
            .collect()
    }

    fn build_matched(&self) -> Vec<MatchedSlots> {
        let count = self.snapshots.len();
        let mut matched: Vec<MatchedSlots> = Vec::new();
        for (snap_idx, snapshot) in self.snapshots.iter().enumerate() {
            for (thread_idx, thread) in snapshot.threads.iter().enumerate() {
                let id = ThreadIdentity::of(thread);
                let pos = match matched.iter().position(|m| m.identity.matches(&id)) {
                    Some(pos) => pos,
                    None => {
                        matched.push(MatchedSlots {
                            identity: id,
                            slots: vec![None; count],
                        });
                        matched.len() - 1
                    }
                };
                matched[pos].slots[snap_idx] = Some(thread_idx);
            }
        }
        matched
    }

    /// The records of `identity` in each snapshot, first match per snapshot.
    pub fn track_thread(&self, identity: &ThreadIdentity) -> Vec<Option<&ThreadRecord>> {
        self.snapshots
            .iter()
            .map(|s| s.threads.iter().find(|t| identity.matches_thread(t)))
            .collect()
    }

    pub fn thread_by_name(&self, index: usize, name: &str) -> Option<&ThreadRecord> {
        self.snapshots.get(index)?.thread_named(name)
    }

    pub fn thread_indices(&self) -> &ThreadIndices {
        self.indices.get_or_init(|| {
            let mut indices = ThreadIndices::default();
            for (s, snapshot) in self.snapshots.iter().enumerate() {
                for (t, thread) in snapshot.threads.iter().enumerate() {
                    if let Some(nid) = thread.native_id {
                        indices.by_native_id.entry(nid).or_default().push((s, t));
                    }
                    if let Some(tid) = thread.logical_id {
                        indices.by_logical_id.entry(tid).or_default().push((s, t));
                    }
                    if let Some(name) = &thread.name {
                        indices.by_name.entry(name.clone()).or_default().push((s, t));
                    }
                }
            }
            indices
        })
    }

    pub fn thread_at(&self, location: ThreadLocation) -> Option<&ThreadRecord> {
        self.snapshots.get(location.0)?.threads.get(location.1)
    }

    pub fn threads_by_native_id(&self, native_id: u64) -> Vec<&ThreadRecord> {
        self.resolve(self.thread_indices().by_native_id.get(&native_id))
    }

    pub fn threads_by_logical_id(&self, logical_id: u64) -> Vec<&ThreadRecord> {
        self.resolve(self.thread_indices().by_logical_id.get(&logical_id))
    }

    pub fn threads_by_name(&self, name: &str) -> Vec<&ThreadRecord> {
        self.resolve(self.thread_indices().by_name.get(name))
    }

    fn resolve(&self, locations: Option<&Vec<ThreadLocation>>) -> Vec<&ThreadRecord> {
        locations
            .into_iter()
            .flatten()
            .filter_map(|loc| self.thread_at(*loc))
            .collect()
    }

    // ── Temporal helpers ────────────────────────────────────────

    /// Per-thread lifecycle over the run. Empty for a single snapshot.
    pub fn thread_evolutions(&self) -> &[ThreadEvolution] {
        self.evolutions.get_or_init(|| {
            if !self.is_multi() {
                return Vec::new();
            }
            let last_index = self.snapshots.len() - 1;
            self.matched_threads()
                .into_iter()
                .filter_map(|history| {
                    let (first_seen, _) = history.first_present()?;
                    let (last_seen, _) = history.last_present()?;
                    let states: Vec<Option<ThreadState>> = history
                        .occurrences
                        .iter()
                        .map(|t| t.and_then(|t| t.state))
                        .collect();
                    let known: Vec<ThreadState> = states.iter().flatten().copied().collect();
                    let state_changed = known.windows(2).any(|w| w[0] != w[1]);
                    Some(ThreadEvolution {
                        identity: history.identity,
                        most_common_state: most_common(&known),
                        states,
                        first_seen,
                        last_seen,
                        appeared_newly: first_seen > 0,
                        disappeared: last_seen < last_index,
                        state_changed,
                    })
                })
                .collect()
        })
    }

    /// Threads that appeared, disappeared or changed state from snapshot
    /// `from` to snapshot `to`.
    pub fn detect_changes(&self, from: usize, to: usize) -> SnapshotChanges {
        let (Some(a), Some(b)) = (self.snapshots.get(from), self.snapshots.get(to)) else {
            return SnapshotChanges::default();
        };
        let mut changes = SnapshotChanges::default();
        for thread in &a.threads {
            match self.match_thread(thread, b) {
                None => changes.disappeared.push(ThreadIdentity::of(thread)),
                Some(later) if later.state != thread.state => {
                    changes.state_changes.push(StateChange {
                        identity: ThreadIdentity::of(thread),
                        from: thread.state,
                        to: later.state,
                    });
                }
                Some(_) => {}
            }
        }
        for thread in &b.threads {
            if self.match_thread(thread, a).is_none() {
                changes.appeared.push(ThreadIdentity::of(thread));
            }
        }
        changes
    }

    // ── Trace data ──────────────────────────────────────────────

    /// The whole trace, loaded on first call. A load failure is logged and
    /// treated as "no trace" for the rest of the run.
    pub fn trace(&self) -> Option<&TraceData> {
        self.trace
            .get_or_init(|| {
                let source = self.trace_source.as_ref()?;
                match source.load() {
                    Ok(data) => {
                        info!(
                            source = %source.describe(),
                            events = data.event_count(),
                            "loaded trace data"
                        );
                        Some(data)
                    }
                    Err(e) => {
                        warn!(source = %source.describe(), %e, "trace data unavailable, continuing without it");
                        None
                    }
                }
            })
            .as_ref()
    }

    pub fn has_trace(&self) -> bool {
        self.trace().is_some_and(|t| !t.is_empty())
    }

    /// Trace events from 5 s before the first snapshot to 5 s after the last.
    pub fn trace_for_range(&self) -> Option<TraceData> {
        let data = self.trace()?;
        Some(data.filter_by_time_range(
            self.first().timestamp_ms - RANGE_TRACE_MARGIN_MS,
            self.last().timestamp_ms + RANGE_TRACE_MARGIN_MS,
        ))
    }

    /// Trace events within 2 s of snapshot `index`.
    pub fn trace_for_snapshot(&self, index: usize) -> Option<TraceData> {
        let snapshot = self.snapshots.get(index)?;
        let data = self.trace()?;
        Some(data.filter_by_time_range(
            snapshot.timestamp_ms - SNAPSHOT_TRACE_MARGIN_MS,
            snapshot.timestamp_ms + SNAPSHOT_TRACE_MARGIN_MS,
        ))
    }
}

fn most_common(states: &[ThreadState]) -> Option<ThreadState> {
    let mut counts: Vec<(ThreadState, usize)> = Vec::new();
    for state in states {
        match counts.iter_mut().find(|(s, _)| s == state) {
            Some((_, n)) => *n += 1,
            None => counts.push((*state, 1)),
        }
    }
    // max_by_key keeps the last maximum; walk in reverse so ties go to the
    // state seen first.
    counts
        .into_iter()
        .rev()
        .max_by_key(|(_, n)| *n)
        .map(|(s, _)| s)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::trace::{InMemoryTrace, TraceLoadError};
    use stallscope_types::trace::{MethodSample, TraceData};

    fn thread(name: &str, native_id: Option<u64>, state: ThreadState) -> ThreadRecord {
        ThreadRecord {
            native_id,
            state: Some(state),
            ..ThreadRecord::named(name)
        }
    }

    fn ctx(snapshots: Vec<Snapshot>) -> CorrelationContext {
        CorrelationContext::new(snapshots, AnalysisOptions::default()).unwrap()
    }

    struct FailingTrace {
        loads: Arc<AtomicUsize>,
    }

    impl TraceSource for FailingTrace {
        fn describe(&self) -> String {
            "broken.json".to_string()
        }

        fn load(&self) -> Result<TraceData, TraceLoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Err(TraceLoadError::Parse {
                path: "broken.json".into(),
                message: "unexpected end of input".to_string(),
            })
        }
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = CorrelationContext::new(Vec::new(), AnalysisOptions::default()).unwrap_err();
        assert_eq!(err, ContextError::NoSnapshots);
        assert_eq!(err.to_string(), "At least one thread dump is required");
    }

    #[test]
    fn matched_threads_have_one_slot_per_snapshot() {
        let c = ctx(vec![
            Snapshot::new(0, vec![thread("a", Some(1), ThreadState::Runnable)]),
            Snapshot::new(
                1000,
                vec![
                    thread("a-renamed", Some(1), ThreadState::Blocked),
                    thread("b", Some(2), ThreadState::Waiting),
                ],
            ),
            Snapshot::new(2000, vec![thread("b", Some(2), ThreadState::Waiting)]),
        ]);

        let matched = c.matched_threads();
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].identity.name.as_deref(), Some("a"));
        assert_eq!(matched[0].occurrences.len(), 3);
        assert!(matched[0].occurrences[1].is_some());
        assert!(matched[0].occurrences[2].is_none());
        assert!(matched[1].occurrences[0].is_none());
        assert_eq!(matched[1].present_count(), 2);
    }

    #[test]
    fn evolutions_track_lifecycle() {
        let c = ctx(vec![
            Snapshot::new(0, vec![thread("a", Some(1), ThreadState::Runnable)]),
            Snapshot::new(
                1000,
                vec![
                    thread("a", Some(1), ThreadState::Blocked),
                    thread("b", Some(2), ThreadState::Waiting),
                ],
            ),
        ]);
        let evolutions = c.thread_evolutions();
        assert_eq!(evolutions.len(), 2);
        assert!(evolutions[0].state_changed);
        assert!(!evolutions[0].appeared_newly);
        assert!(evolutions[1].appeared_newly);
        assert_eq!(evolutions[1].most_common_state, Some(ThreadState::Waiting));

        let single = ctx(vec![Snapshot::new(0, vec![thread("a", Some(1), ThreadState::Runnable)])]);
        assert!(single.thread_evolutions().is_empty());
    }

    #[test]
    fn changes_between_snapshots() {
        let c = ctx(vec![
            Snapshot::new(
                0,
                vec![
                    thread("a", Some(1), ThreadState::Runnable),
                    thread("gone", Some(3), ThreadState::Waiting),
                ],
            ),
            Snapshot::new(
                1000,
                vec![
                    thread("a", Some(1), ThreadState::Blocked),
                    thread("new", Some(4), ThreadState::Runnable),
                ],
            ),
        ]);
        let changes = c.detect_changes(0, 1);
        assert_eq!(changes.appeared.len(), 1);
        assert_eq!(changes.disappeared.len(), 1);
        assert_eq!(changes.state_changes.len(), 1);
        assert_eq!(changes.state_changes[0].to, Some(ThreadState::Blocked));
        assert_eq!(c.timespan_between(0, 1), 1000);
        assert_eq!(c.timespan_between(1, 0), 0);
        assert_eq!(c.time_span_ms(), 1000);
    }

    #[test]
    fn indices_find_threads() {
        let c = ctx(vec![
            Snapshot::new(0, vec![thread("a", Some(1), ThreadState::Runnable)]),
            Snapshot::new(1000, vec![thread("a", Some(1), ThreadState::Runnable)]),
        ]);
        assert_eq!(c.threads_by_native_id(1).len(), 2);
        assert_eq!(c.threads_by_name("a").len(), 2);
        assert!(c.threads_by_logical_id(7).is_empty());
        assert!(c.thread_by_name(1, "a").is_some());
        assert_eq!(c.track_thread(&ThreadIdentity::of(&c.first().threads[0])).len(), 2);
    }

    #[test]
    fn failed_trace_load_degrades_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let c = CorrelationContext::with_trace(
            vec![Snapshot::new(0, Vec::new())],
            Box::new(FailingTrace {
                loads: loads.clone(),
            }),
            AnalysisOptions::default(),
        )
        .unwrap();
        assert!(c.trace().is_none());
        assert!(!c.has_trace());
        assert!(c.trace_for_range().is_none());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn trace_windows() {
        let sample = |ts: i64| MethodSample {
            timestamp_ms: ts,
            thread_name: Some("t".to_string()),
            thread_id: None,
            thread_state: None,
            frames: Vec::new(),
        };
        let data = TraceData {
            execution_samples: vec![sample(-6_000), sample(-4_000), sample(9_000), sample(16_000)],
            ..TraceData::default()
        };
        let c = CorrelationContext::with_trace(
            vec![Snapshot::new(0, Vec::new()), Snapshot::new(10_000, Vec::new())],
            Box::new(InMemoryTrace(data)),
            AnalysisOptions::default(),
        )
        .unwrap();
        assert!(c.has_trace());
        assert_eq!(c.trace_for_range().unwrap().execution_samples.len(), 2);
        assert_eq!(c.trace_for_snapshot(1).unwrap().execution_samples.len(), 1);
        assert!(c.trace_for_snapshot(5).is_none());
    }
}
