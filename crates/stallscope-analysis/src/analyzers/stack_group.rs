//! Threads of one snapshot that share an identical stack.

use facet::Facet;
use stallscope_types::StackFrame;

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::context::CorrelationContext;
use crate::grouping::{self, EvolutionSettings, GroupEvolution, StackGroup};
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};

/// Frames from the top of the stack used to match groups across snapshots.
const SIGNATURE_DEPTH: usize = 3;
const STUCK_MIN_OCCURRENCES: usize = 3;
const SHRINKING_MIN_SIZE: usize = 10;

/// Top-of-stack classes that mean the group sits in blocking I/O.
const IO_TOP_CLASSES: &[&str] = &[
    "SocketInputStream",
    "FileInputStream",
    "PlainSocketImpl",
    "EPoll",
    "WindowsSelectorImpl",
];
/// Top-of-stack methods that mean the group waits on a lock.
const LOCK_TOP_METHODS: &[&str] = &["park", "wait", "lock", "acquire"];

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct StackGroupReport {
    /// Every group, largest first.
    pub groups: Vec<StackGroup>,
    #[facet(default)]
    pub evolution: Vec<GroupEvolution>,
    pub min_group_size: usize,
}

impl StackGroupReport {
    pub fn groups_at(&self, snapshot_index: usize) -> impl Iterator<Item = &StackGroup> {
        self.groups
            .iter()
            .filter(move |g| g.snapshot_index == snapshot_index)
    }

    pub fn largest(&self) -> Option<&StackGroup> {
        self.groups.first()
    }

    pub fn grouped_thread_count(&self) -> usize {
        self.groups.iter().map(StackGroup::size).sum()
    }

    pub fn summary(&self) -> String {
        if self.groups.is_empty() {
            return "No thread groups with identical stacks found".to_string();
        }
        format!(
            "{} groups with identical stacks ({} threads total)",
            self.groups.len(),
            self.grouped_thread_count()
        )
    }
}

pub struct StackGroupAnalyzer {
    min_group_size: usize,
    growth_delta: usize,
}

impl Default for StackGroupAnalyzer {
    fn default() -> Self {
        Self {
            min_group_size: 2,
            growth_delta: 5,
        }
    }
}

impl StackGroupAnalyzer {
    pub const NAME: &'static str = "stack-group";

    pub fn new(min_group_size: usize, growth_delta: usize) -> Self {
        Self {
            min_group_size: min_group_size.max(1),
            growth_delta,
        }
    }
}

impl Analyzer for StackGroupAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Groups threads by identical stack traces to identify clusters"
    }

    fn can_analyze(&self, ctx: &CorrelationContext) -> bool {
        ctx.options().toggles().group_identical_stacks
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let mut groups: Vec<StackGroup> = Vec::new();
        for (index, snapshot) in ctx.snapshots().iter().enumerate() {
            let threads = ctx.filtered_threads(snapshot);
            groups.extend(grouping::group_threads(
                &threads,
                index,
                snapshot.timestamp_ms,
                self.min_group_size,
                |t| t.stack.as_slice(),
            ));
        }
        groups.sort_by_key(|g| std::cmp::Reverse(g.size()));

        let evolution = grouping::evolve(
            &groups,
            EvolutionSettings {
                snapshot_count: ctx.snapshot_count(),
                persistence_fraction: ctx.options().thresholds().stuck_thread_threshold,
                track_membership: false,
            },
            |g| grouping::frames_signature(&g.frames[..g.frames.len().min(SIGNATURE_DEPTH)]),
            |g| grouping::short_frame(g.top_frame(), "unknown"),
        );

        let mut findings: Vec<Finding> = groups.iter().map(group_finding).collect();
        findings.extend(
            evolution
                .iter()
                .filter_map(|evo| self.evolution_finding(evo)),
        );

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::StackGroup(StackGroupReport {
                groups,
                evolution,
                min_group_size: self.min_group_size,
            }),
        ))
    }
}

impl StackGroupAnalyzer {
    fn evolution_finding(&self, evo: &GroupEvolution) -> Option<Finding> {
        if evo.is_growing() && evo.size_change > self.growth_delta as i64 {
            Some(
                Finding::builder(
                    Severity::Warning,
                    "growing-stack-group",
                    format!(
                        "Stack group growing: {} → {} threads ({})",
                        evo.first_size, evo.last_size, evo.label
                    ),
                )
                .detail("size_change", &evo.size_change)
                .detail("first_snapshot", &evo.first_seen)
                .detail("last_snapshot", &evo.last_seen)
                .build(),
            )
        } else if evo.is_shrinking() && evo.first_size > SHRINKING_MIN_SIZE {
            Some(
                Finding::builder(
                    Severity::Info,
                    "shrinking-stack-group",
                    format!(
                        "Stack group shrinking: {} → {} threads ({})",
                        evo.first_size, evo.last_size, evo.label
                    ),
                )
                .detail("size_change", &evo.size_change)
                .build(),
            )
        } else if evo.stuck && evo.occurrences >= STUCK_MIN_OCCURRENCES {
            Some(
                Finding::builder(
                    Severity::Warning,
                    "stuck-stack-group",
                    format!(
                        "Stack group stuck: {} threads unchanged across {} dumps ({})",
                        evo.first_size, evo.occurrences, evo.label
                    ),
                )
                .detail("occurrences", &evo.occurrences)
                .build(),
            )
        } else {
            None
        }
    }
}

fn group_finding(group: &StackGroup) -> Finding {
    let top = grouping::short_frame(group.top_frame(), "empty");
    Finding::builder(
        group_severity(group.size(), group.top_frame()),
        "identical-stacks",
        format!("{} threads share identical stack at {top}", group.size()),
    )
    .affected_threads(group.thread_labels())
    .detail("snapshot_index", &group.snapshot_index)
    .detail("stack_depth", &group.frames.len())
    .detail("top_frame", &top)
    .build()
}

/// Groups parked in I/O or on a lock escalate at 10 threads, others at 20.
/// Any group of 5 or more is worth an INFO.
pub fn group_severity(size: usize, top: Option<&StackFrame>) -> Severity {
    let blocking = top.is_some_and(|f| {
        IO_TOP_CLASSES.iter().any(|c| f.class_name.contains(c))
            || LOCK_TOP_METHODS.contains(&f.method_name.as_str())
    });
    let warning_at = if blocking { 10 } else { 20 };
    if size >= warning_at {
        Severity::Warning
    } else if size >= 5 {
        Severity::Info
    } else {
        Severity::Ok
    }
}
