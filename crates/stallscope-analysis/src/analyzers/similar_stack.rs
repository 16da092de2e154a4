//! Threads that share an entry point: the same bottom frames, whatever the
//! top of the stack is doing.

use facet::Facet;

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::context::CorrelationContext;
use crate::grouping::{self, EvolutionSettings, GroupEvolution, StackGroup};
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};

/// Stability below which a recurring pattern is reported as migrating.
const LOW_STABILITY: f64 = 0.5;
const STUCK_MIN_OCCURRENCES: usize = 3;

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct SimilarStackReport {
    /// Every group, largest first. `frames` holds the shared entry frames.
    pub groups: Vec<StackGroup>,
    #[facet(default)]
    pub evolution: Vec<GroupEvolution>,
    pub prefix_depth: usize,
}

impl SimilarStackReport {
    pub fn groups_at(&self, snapshot_index: usize) -> impl Iterator<Item = &StackGroup> {
        self.groups
            .iter()
            .filter(move |g| g.snapshot_index == snapshot_index)
    }

    pub fn grouped_thread_count(&self) -> usize {
        self.groups.iter().map(StackGroup::size).sum()
    }

    pub fn migrating(&self) -> impl Iterator<Item = &GroupEvolution> {
        self.evolution.iter().filter(|e| e.is_migrating())
    }

    pub fn summary(&self) -> String {
        if self.groups.is_empty() {
            return "No similar stack groups found".to_string();
        }
        format!(
            "{} groups with similar entry points ({} threads total)",
            self.groups.len(),
            self.grouped_thread_count()
        )
    }
}

pub struct SimilarStackAnalyzer {
    min_group_size: usize,
    prefix_depth: usize,
    growth_delta: usize,
}

impl Default for SimilarStackAnalyzer {
    fn default() -> Self {
        Self {
            min_group_size: 2,
            prefix_depth: 100,
            growth_delta: 5,
        }
    }
}

impl SimilarStackAnalyzer {
    pub const NAME: &'static str = "similar-stack";

    pub fn new(min_group_size: usize, prefix_depth: usize, growth_delta: usize) -> Self {
        Self {
            min_group_size: min_group_size.max(1),
            prefix_depth: prefix_depth.max(1),
            growth_delta,
        }
    }
}

/// Label of an entry-point group: its bottom frame.
fn entry_point(group: &StackGroup) -> String {
    grouping::short_frame(group.frames.last(), "unknown")
}

impl Analyzer for SimilarStackAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Groups threads by common stack trace prefix (entry point grouping)"
    }

    fn priority(&self) -> i32 {
        40
    }

    fn can_analyze(&self, ctx: &CorrelationContext) -> bool {
        ctx.options().toggles().group_similar_stacks
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let depth = self.prefix_depth;
        let mut groups: Vec<StackGroup> = Vec::new();
        for (index, snapshot) in ctx.snapshots().iter().enumerate() {
            let threads = ctx.filtered_threads(snapshot);
            groups.extend(grouping::group_threads(
                &threads,
                index,
                snapshot.timestamp_ms,
                self.min_group_size,
                |t| &t.stack[t.stack.len().saturating_sub(depth)..],
            ));
        }
        groups.sort_by_key(|g| std::cmp::Reverse(g.size()));

        let evolution = grouping::evolve(
            &groups,
            EvolutionSettings {
                snapshot_count: ctx.snapshot_count(),
                persistence_fraction: ctx.options().thresholds().stuck_thread_threshold,
                track_membership: true,
            },
            |g| grouping::frames_signature(&g.frames),
            entry_point,
        );

        let mut findings: Vec<Finding> = groups
            .iter()
            .map(|group| {
                let entry = entry_point(group);
                Finding::builder(
                    pattern_severity(group.size()),
                    "similar-stacks",
                    format!("{} threads share entry point: {entry}", group.size()),
                )
                .affected_threads(group.thread_labels())
                .detail("snapshot_index", &group.snapshot_index)
                .detail("prefix_depth", &group.frames.len())
                .detail("entry_point", &entry)
                .build()
            })
            .collect();

        for evo in &evolution {
            if evo.is_growing() && evo.size_change > self.growth_delta as i64 {
                findings.push(
                    Finding::builder(
                        Severity::Warning,
                        "growing-pattern",
                        format!(
                            "Entry point pattern growing: {} → {} threads ({})",
                            evo.first_size, evo.last_size, evo.label
                        ),
                    )
                    .detail("size_change", &evo.size_change)
                    .detail("entry_point", &evo.label)
                    .build(),
                );
            } else if let Some(stability) = evo.stability
                && evo.is_migrating()
                && stability < LOW_STABILITY
            {
                findings.push(
                    Finding::builder(
                        Severity::Info,
                        "pattern-migration",
                        format!(
                            "Thread migration detected in pattern {} (stability: {:.1}%)",
                            evo.label,
                            stability * 100.0
                        ),
                    )
                    .detail("stability", &stability)
                    .build(),
                );
            } else if evo.stuck && evo.occurrences >= STUCK_MIN_OCCURRENCES && !evo.is_migrating()
            {
                findings.push(
                    Finding::builder(
                        Severity::Warning,
                        "stuck-pattern",
                        format!(
                            "Entry point pattern stuck: {} threads unchanged across {} dumps ({})",
                            evo.first_size, evo.occurrences, evo.label
                        ),
                    )
                    .affected_threads(
                        groups
                            .iter()
                            .filter(|g| g.snapshot_index == evo.last_seen)
                            .filter(|g| grouping::frames_signature(&g.frames) == evo.signature)
                            .flat_map(|g| g.thread_labels()),
                    )
                    .detail("occurrences", &evo.occurrences)
                    .detail("entry_point", &evo.label)
                    .build(),
                );
            }
        }

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::SimilarStack(SimilarStackReport {
                groups,
                evolution,
                prefix_depth: depth,
            }),
        ))
    }
}

fn pattern_severity(size: usize) -> Severity {
    if size >= 20 {
        Severity::Warning
    } else if size >= 10 {
        Severity::Info
    } else {
        Severity::Ok
    }
}
