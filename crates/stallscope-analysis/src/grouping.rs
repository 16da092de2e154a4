//! Per-snapshot thread groups and their evolution across snapshots.
//!
//! Both stack groupers produce [`StackGroup`]s keyed by some frame slice,
//! then hand them to [`evolve`], which collects groups of the same
//! signature and tracks size and membership over time.

use std::collections::{BTreeSet, HashMap};

use facet::Facet;
use stallscope_types::{StackFrame, ThreadRecord, simple_class_name};

use crate::identity::ThreadIdentity;

/// Threads of one snapshot that share a frame slice.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct StackGroup {
    /// The shared frames, innermost first.
    pub frames: Vec<StackFrame>,
    pub threads: Vec<ThreadIdentity>,
    pub snapshot_index: usize,
    pub timestamp_ms: i64,
}

impl StackGroup {
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    pub fn thread_labels(&self) -> Vec<String> {
        self.threads.iter().map(ThreadIdentity::label).collect()
    }

    pub fn top_frame(&self) -> Option<&StackFrame> {
        self.frames.first()
    }

    fn names(&self) -> BTreeSet<&str> {
        self.threads.iter().filter_map(|t| t.name.as_deref()).collect()
    }
}

/// Buckets `threads` by `key`, keeping first-appearance order, and returns
/// buckets of at least `min_size` threads as groups.
pub fn group_threads<'a, F>(
    threads: &[&'a ThreadRecord],
    snapshot_index: usize,
    timestamp_ms: i64,
    min_size: usize,
    key: F,
) -> Vec<StackGroup>
where
    F: Fn(&'a ThreadRecord) -> &'a [StackFrame],
{
    let mut order: Vec<&'a [StackFrame]> = Vec::new();
    let mut buckets: HashMap<&'a [StackFrame], Vec<&'a ThreadRecord>> = HashMap::new();
    for &thread in threads {
        if thread.stack.is_empty() {
            continue;
        }
        let frames = key(thread);
        buckets
            .entry(frames)
            .or_insert_with(|| {
                order.push(frames);
                Vec::new()
            })
            .push(thread);
    }

    order
        .into_iter()
        .filter_map(|frames| {
            let members = buckets.remove(frames)?;
            (members.len() >= min_size).then(|| StackGroup {
                frames: frames.to_vec(),
                threads: members.into_iter().map(ThreadIdentity::of).collect(),
                snapshot_index,
                timestamp_ms,
            })
        })
        .collect()
}

/// `class.method` of each frame, pipe-joined.
pub fn frames_signature(frames: &[StackFrame]) -> String {
    frames
        .iter()
        .map(StackFrame::qualified_method)
        .collect::<Vec<_>>()
        .join("|")
}

/// `SimpleClass.method` of a frame, or `fallback` when absent.
pub fn short_frame(frame: Option<&StackFrame>, fallback: &str) -> String {
    match frame {
        Some(f) => format!("{}.{}", simple_class_name(&f.class_name), f.method_name),
        None => fallback.to_string(),
    }
}

// ── Evolution ───────────────────────────────────────────────────

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum GroupTrend {
    Stuck,
    Growing,
    Shrinking,
    Migrating,
    Stable,
}

impl GroupTrend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stuck => "STUCK",
            Self::Growing => "GROWING",
            Self::Shrinking => "SHRINKING",
            Self::Migrating => "MIGRATING",
            Self::Stable => "STABLE",
        }
    }
}

/// How one signature's groups change over the run.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct GroupEvolution {
    pub signature: String,
    /// Short form of the frame the group is named after.
    pub label: String,
    /// Group size per occurrence, in snapshot order.
    pub sizes: Vec<usize>,
    pub first_seen: usize,
    pub last_seen: usize,
    pub occurrences: usize,
    pub first_size: usize,
    pub last_size: usize,
    pub size_change: i64,
    /// Same size in every occurrence.
    pub stuck: bool,
    /// Seen in at least the configured fraction of snapshots.
    pub persistent: bool,
    /// Share of the earliest occurrence's thread names that reappear later.
    #[facet(skip_unless_truthy)]
    pub stability: Option<f64>,
}

impl GroupEvolution {
    pub fn is_growing(&self) -> bool {
        self.size_change > 0
    }

    pub fn is_shrinking(&self) -> bool {
        self.size_change < 0
    }

    /// Membership turns over while the pattern stays.
    pub fn is_migrating(&self) -> bool {
        self.stability.is_some_and(|s| s < MIGRATION_STABILITY)
    }

    pub fn span(&self) -> usize {
        self.last_seen - self.first_seen + 1
    }

    pub fn growth_rate(&self) -> f64 {
        if self.first_size == 0 {
            0.0
        } else {
            self.size_change as f64 * 100.0 / self.first_size as f64
        }
    }

    /// Stuck wins over growth; migration is only reported for membership-tracked groups.
    pub fn trend(&self) -> GroupTrend {
        if self.stability.is_none() && self.stuck {
            GroupTrend::Stuck
        } else if self.is_growing() {
            GroupTrend::Growing
        } else if self.is_shrinking() {
            GroupTrend::Shrinking
        } else if self.is_migrating() {
            GroupTrend::Migrating
        } else {
            GroupTrend::Stable
        }
    }
}

/// Stability below which a pattern's membership counts as rotating.
pub const MIGRATION_STABILITY: f64 = 0.7;

/// Settings for [`evolve`].
#[derive(Debug, Clone, Copy)]
pub struct EvolutionSettings {
    pub snapshot_count: usize,
    /// Fraction of snapshots a signature must occur in to be persistent.
    pub persistence_fraction: f64,
    /// Compute the membership stability score.
    pub track_membership: bool,
}

/// Collects `groups` under `signature` and summarizes each signature,
/// labelled by `label` of its earliest group.
///
/// Nothing evolves over a single snapshot. The result is ordered by the
/// magnitude of the size change, largest first.
pub fn evolve<S, L>(
    groups: &[StackGroup],
    settings: EvolutionSettings,
    signature: S,
    label: L,
) -> Vec<GroupEvolution>
where
    S: Fn(&StackGroup) -> String,
    L: Fn(&StackGroup) -> String,
{
    if settings.snapshot_count <= 1 || groups.is_empty() {
        return Vec::new();
    }

    let mut order: Vec<String> = Vec::new();
    let mut by_signature: HashMap<String, Vec<&StackGroup>> = HashMap::new();
    for group in groups {
        let sig = signature(group);
        by_signature
            .entry(sig.clone())
            .or_insert_with(|| {
                order.push(sig);
                Vec::new()
            })
            .push(group);
    }

    let mut evolutions: Vec<GroupEvolution> = order
        .into_iter()
        .filter_map(|sig| {
            let mut occurrences = by_signature.remove(&sig)?;
            occurrences.sort_by_key(|g| g.snapshot_index);
            let (first, last) = (*occurrences.first()?, *occurrences.last()?);
            let sizes: Vec<usize> = occurrences.iter().map(|g| g.size()).collect();
            let stuck = sizes.windows(2).all(|w| w[0] == w[1]);
            let persistent = occurrences.len() as f64
                >= settings.snapshot_count as f64 * settings.persistence_fraction;
            Some(GroupEvolution {
                label: label(first),
                first_seen: first.snapshot_index,
                last_seen: last.snapshot_index,
                occurrences: occurrences.len(),
                first_size: first.size(),
                last_size: last.size(),
                size_change: last.size() as i64 - first.size() as i64,
                stuck,
                persistent,
                stability: settings
                    .track_membership
                    .then(|| stability_score(&occurrences)),
                sizes,
                signature: sig,
            })
        })
        .collect();

    evolutions.sort_by_key(|e| std::cmp::Reverse(e.size_change.unsigned_abs()));
    evolutions
}

/// Average share of the earliest occurrence's named threads found in each
/// later occurrence. 1.0 for a single occurrence, 0.0 when the earliest
/// occurrence has no named threads.
pub fn stability_score(occurrences: &[&StackGroup]) -> f64 {
    let [first, rest @ ..] = occurrences else {
        return 1.0;
    };
    if rest.is_empty() {
        return 1.0;
    }
    let baseline = first.names();
    if baseline.is_empty() {
        return 0.0;
    }
    let matches: usize = rest
        .iter()
        .map(|g| g.names().intersection(&baseline).count())
        .sum();
    matches as f64 / (baseline.len() * rest.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(snapshot_index: usize, names: &[&str]) -> StackGroup {
        StackGroup {
            frames: vec![StackFrame::new("com.acme.Handler", "handle")],
            threads: names
                .iter()
                .map(|n| ThreadIdentity {
                    name: Some(n.to_string()),
                    ..ThreadIdentity::default()
                })
                .collect(),
            snapshot_index,
            timestamp_ms: snapshot_index as i64 * 1_000,
        }
    }

    fn settings(snapshot_count: usize) -> EvolutionSettings {
        EvolutionSettings {
            snapshot_count,
            persistence_fraction: 0.9,
            track_membership: true,
        }
    }

    #[test]
    fn stability_is_one_for_the_same_members() {
        let a = group(0, &["w1", "w2", "w3"]);
        let b = group(1, &["w3", "w2", "w1"]);
        let c = group(2, &["w1", "w2", "w3"]);
        assert_eq!(stability_score(&[&a, &b, &c]), 1.0);
    }

    #[test]
    fn stability_drops_when_members_rotate() {
        let a = group(0, &["w1", "w2", "w3", "w4"]);
        let b = group(1, &["w1", "w5", "w6", "w7"]);
        let c = group(2, &["w8", "w9", "w10", "w11"]);
        // (1 + 0) / (4 * 2)
        assert_eq!(stability_score(&[&a, &b, &c]), 0.125);
    }

    #[test]
    fn unnamed_baseline_has_zero_stability() {
        let mut a = group(0, &[]);
        a.threads.push(ThreadIdentity {
            native_id: Some(1),
            ..ThreadIdentity::default()
        });
        let b = group(1, &["w1"]);
        assert_eq!(stability_score(&[&a, &b]), 0.0);
        assert_eq!(stability_score(&[&b]), 1.0);
    }

    #[test]
    fn evolution_tracks_sizes_in_snapshot_order() {
        let groups = vec![
            group(2, &["a", "b", "c", "d"]),
            group(0, &["a", "b"]),
            group(1, &["a", "b", "c"]),
        ];
        let evo = evolve(
            &groups,
            settings(3),
            |g| frames_signature(&g.frames),
            |g| short_frame(g.top_frame(), "unknown"),
        );
        assert_eq!(evo.len(), 1);
        let e = &evo[0];
        assert_eq!(e.sizes, vec![2, 3, 4]);
        assert_eq!((e.first_seen, e.last_seen, e.occurrences), (0, 2, 3));
        assert_eq!(e.size_change, 2);
        assert!(e.is_growing());
        assert!(!e.stuck);
        assert!(e.persistent);
        assert_eq!(e.stability, Some(1.0));
        assert_eq!(e.trend(), GroupTrend::Growing);
        assert_eq!(e.growth_rate(), 100.0);
        assert_eq!(e.label, "Handler.handle");
    }

    #[test]
    fn single_snapshot_has_no_evolution() {
        let groups = vec![group(0, &["a", "b"])];
        let evo = evolve(
            &groups,
            settings(1),
            |g| frames_signature(&g.frames),
            |g| short_frame(g.top_frame(), "unknown"),
        );
        assert!(evo.is_empty());
    }

    #[test]
    fn grouping_skips_empty_stacks_and_small_buckets() {
        let mut a = ThreadRecord::named("a");
        a.stack = vec![StackFrame::new("X", "run")];
        let mut b = ThreadRecord::named("b");
        b.stack = vec![StackFrame::new("X", "run")];
        let mut c = ThreadRecord::named("c");
        c.stack = vec![StackFrame::new("Y", "run")];
        let d = ThreadRecord::named("d");
        let e = ThreadRecord::named("e");

        let threads = vec![&a, &b, &c, &d, &e];
        let groups = group_threads(&threads, 0, 0, 2, |t| t.stack.as_slice());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].thread_labels(), vec!["a", "b"]);
        assert_eq!(short_frame(groups[0].top_frame(), "empty"), "X.run");
    }
}
