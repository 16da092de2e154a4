//! Per-thread progress classification.
//!
//! With one snapshot only the thread state is available. With several,
//! each thread's matched history decides: CPU-time deltas and stack changes
//! separate a busy RUNNABLE thread from a spinning or parked one.

use std::fmt;

use facet::Facet;
use stallscope_types::{ThreadRecord, ThreadState};

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::analyzers::percent;
use crate::context::CorrelationContext;
use crate::identity::ThreadIdentity;
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum ProgressClass {
    Active,
    RunnableNoProgress,
    BlockedOnLock,
    WaitingExpected,
    TimedWaitingExpected,
    Stuck,
    Restarted,
    Terminated,
    Ignored,
    New,
    Unknown,
}

impl ProgressClass {
    pub const ALL: [ProgressClass; 11] = [
        Self::Active,
        Self::RunnableNoProgress,
        Self::BlockedOnLock,
        Self::WaitingExpected,
        Self::TimedWaitingExpected,
        Self::Stuck,
        Self::Restarted,
        Self::Terminated,
        Self::Ignored,
        Self::New,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::RunnableNoProgress => "RUNNABLE_NO_PROGRESS",
            Self::BlockedOnLock => "BLOCKED_ON_LOCK",
            Self::WaitingExpected => "WAITING_EXPECTED",
            Self::TimedWaitingExpected => "TIMED_WAITING_EXPECTED",
            Self::Stuck => "STUCK",
            Self::Restarted => "RESTARTED",
            Self::Terminated => "TERMINATED",
            Self::Ignored => "IGNORED",
            Self::New => "NEW",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Active => "Thread is actively making progress",
            Self::RunnableNoProgress => "Thread is RUNNABLE but making no progress",
            Self::BlockedOnLock => "Thread is blocked waiting for a lock",
            Self::WaitingExpected => "Thread is waiting (expected behavior)",
            Self::TimedWaitingExpected => "Thread is timed waiting (expected behavior)",
            Self::Stuck => "Thread appears stuck",
            Self::Restarted => "Thread was restarted",
            Self::Terminated => "Thread has terminated",
            Self::Ignored => "Thread is ignored by filter",
            Self::New => "Thread is new",
            Self::Unknown => "Classification cannot be determined",
        }
    }

    pub fn is_problem(self) -> bool {
        matches!(
            self,
            Self::RunnableNoProgress | Self::BlockedOnLock | Self::Stuck
        )
    }

    pub fn is_healthy(self) -> bool {
        matches!(
            self,
            Self::Active | Self::WaitingExpected | Self::TimedWaitingExpected | Self::New
        )
    }

    pub fn counts_for_stall_detection(self) -> bool {
        !matches!(
            self,
            Self::Ignored | Self::Terminated | Self::Unknown | Self::New
        )
    }

    fn severity(self) -> Severity {
        match self {
            Self::Stuck => Severity::Error,
            Self::RunnableNoProgress | Self::BlockedOnLock => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for ProgressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Payload ─────────────────────────────────────────────────────

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ThreadProgress {
    pub identity: ThreadIdentity,
    pub class: ProgressClass,
    /// State per snapshot; `None` where the thread was absent.
    pub states: Vec<Option<ThreadState>>,
}

#[derive(Facet, Clone, Copy, Debug, Default, PartialEq)]
pub struct ProgressSummary {
    pub total: usize,
    pub active: usize,
    pub no_progress: usize,
    pub blocked: usize,
    pub stuck: usize,
    pub waiting: usize,
}

impl ProgressSummary {
    pub fn problem_count(&self) -> usize {
        self.no_progress + self.blocked + self.stuck
    }

    pub fn problem_percentage(&self) -> f64 {
        percent(self.problem_count(), self.total)
    }

    /// Problem share at or above `threshold_pct`.
    pub fn indicates_stall(&self, threshold_pct: f64) -> bool {
        self.problem_percentage() >= threshold_pct
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ProgressReport {
    pub threads: Vec<ThreadProgress>,
    pub stats: ProgressSummary,
    /// Whether per-thread history was used.
    pub temporal: bool,
}

impl ProgressReport {
    pub fn by_class(&self, class: ProgressClass) -> impl Iterator<Item = &ThreadProgress> {
        self.threads.iter().filter(move |t| t.class == class)
    }

    pub fn problems(&self) -> impl Iterator<Item = &ThreadProgress> {
        self.threads.iter().filter(|t| t.class.is_problem())
    }

    pub fn progress_of(&self, identity: &ThreadIdentity) -> Option<&ThreadProgress> {
        self.threads.iter().find(|t| t.identity.matches(identity))
    }

    pub fn summary(&self) -> String {
        format!(
            "Progress: {} active, {} no-progress, {} blocked, {} stuck ({:.1}% problem)",
            self.stats.active,
            self.stats.no_progress,
            self.stats.blocked,
            self.stats.stuck,
            self.stats.problem_percentage()
        )
    }
}

// ── Classification ──────────────────────────────────────────────

/// WAITING is expected for pool and executor workers.
pub fn is_expected_waiting(name: &str) -> bool {
    ["pool", "Pool", "worker", "Worker", "executor", "Executor"]
        .iter()
        .any(|p| name.contains(p))
        || name.starts_with("ForkJoinPool")
        || name.starts_with("CommonPool")
}

/// TIMED_WAITING is expected for timers, schedulers and keepalives.
pub fn is_expected_timed_waiting(name: &str) -> bool {
    ["Timer", "Scheduler", "Scheduled", "KeepAlive", "Heartbeat"]
        .iter()
        .any(|p| name.contains(p))
}

/// State-only classification for a lone snapshot.
pub fn classify_single(thread: &ThreadRecord) -> ProgressClass {
    let name = thread.name_or_empty();
    match thread.state {
        None => ProgressClass::Unknown,
        Some(ThreadState::New) => ProgressClass::New,
        Some(ThreadState::Runnable) => ProgressClass::Active,
        Some(ThreadState::Blocked) => ProgressClass::BlockedOnLock,
        Some(ThreadState::Waiting) if is_expected_waiting(name) => ProgressClass::WaitingExpected,
        Some(ThreadState::TimedWaiting) if is_expected_timed_waiting(name) => {
            ProgressClass::TimedWaitingExpected
        }
        Some(ThreadState::Waiting | ThreadState::TimedWaiting) => ProgressClass::Stuck,
        Some(ThreadState::Terminated) => ProgressClass::Terminated,
    }
}

/// Classification from a matched history, first matching rule wins.
pub fn classify_history(history: &[Option<&ThreadRecord>], cpu_epsilon_ms: f64) -> ProgressClass {
    let (Some(first_slot), Some(last_slot)) = (history.first(), history.last()) else {
        return ProgressClass::Unknown;
    };
    let present: Vec<&ThreadRecord> = history.iter().flatten().copied().collect();
    let (Some(&first), Some(&last)) = (present.first(), present.last()) else {
        return ProgressClass::Unknown;
    };

    if first_slot.is_none() {
        return ProgressClass::New;
    }
    if last_slot.is_none() {
        return ProgressClass::Terminated;
    }
    if let (Some(first_elapsed), Some(last_elapsed)) = (first.elapsed_time_ms, last.elapsed_time_ms)
        && last_elapsed < first_elapsed
    {
        return ProgressClass::Restarted;
    }

    let name = last.name_or_empty();
    match last.state {
        Some(ThreadState::Terminated) => return ProgressClass::Terminated,
        Some(ThreadState::Blocked) => return ProgressClass::BlockedOnLock,
        Some(ThreadState::Waiting) if is_expected_waiting(name) => {
            return ProgressClass::WaitingExpected;
        }
        Some(ThreadState::TimedWaiting) if is_expected_timed_waiting(name) => {
            return ProgressClass::TimedWaitingExpected;
        }
        Some(ThreadState::Runnable) => {
            return if has_cpu_progress(&present, cpu_epsilon_ms) || has_stack_changed(&present) {
                ProgressClass::Active
            } else {
                ProgressClass::RunnableNoProgress
            };
        }
        _ => {}
    }

    if is_stuck(&present) {
        return ProgressClass::Stuck;
    }
    ProgressClass::Unknown
}

fn has_cpu_progress(present: &[&ThreadRecord], epsilon_ms: f64) -> bool {
    let mut cpu = present.iter().filter_map(|t| t.cpu_time_ms);
    let Some(first) = cpu.next() else {
        return false;
    };
    let last = cpu.last().unwrap_or(first);
    last - first > epsilon_ms
}

fn has_stack_changed(present: &[&ThreadRecord]) -> bool {
    let mut stacks = present.iter().filter(|t| !t.stack.is_empty()).map(|t| &t.stack);
    let Some(first) = stacks.next() else {
        return false;
    };
    stacks.any(|s| s != first)
}

/// At least two occurrences with the first occurrence's state and stack,
/// outside RUNNABLE.
fn is_stuck(present: &[&ThreadRecord]) -> bool {
    let Some(first) = present.first() else {
        return false;
    };
    let unchanged = present
        .iter()
        .filter(|t| t.state == first.state && t.stack == first.stack)
        .count();
    unchanged >= 2 && first.state != Some(ThreadState::Runnable)
}

// ── Analyzer ────────────────────────────────────────────────────

pub struct ThreadProgressAnalyzer;

impl ThreadProgressAnalyzer {
    pub const NAME: &'static str = "thread-progress";
}

impl Analyzer for ThreadProgressAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Classifies thread progress between dumps to detect stalls"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn can_analyze(&self, ctx: &CorrelationContext) -> bool {
        ctx.options().toggles().detect_no_progress
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let report = classify(ctx);

        let mut findings = Vec::new();
        for class in ProgressClass::ALL.into_iter().filter(|c| c.is_problem()) {
            let affected: Vec<&ThreadProgress> = report.by_class(class).collect();
            if affected.is_empty() {
                continue;
            }
            findings.push(
                Finding::builder(
                    class.severity(),
                    "progress",
                    format!("{} threads classified as {class}", affected.len()),
                )
                .affected_threads(affected.iter().map(|t| t.identity.label()))
                .detail("classification", &class)
                .detail("count", &affected.len())
                .build(),
            );
        }

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::Progress(report),
        ))
    }
}

/// Classifies every thread of the context.
pub fn classify(ctx: &CorrelationContext) -> ProgressReport {
    let temporal =
        ctx.is_multi() && ctx.snapshot_count() >= ctx.options().thresholds().min_dumps_for_stall;
    let epsilon = ctx.options().thresholds().cpu_epsilon_ms;

    let threads: Vec<ThreadProgress> = if temporal {
        ctx.matched_threads()
            .into_iter()
            .map(|history| {
                let last = history.last_present().map(|(_, t)| t);
                let class = match last {
                    Some(t) if !ctx.accepts(t) => ProgressClass::Ignored,
                    _ => classify_history(&history.occurrences, epsilon),
                };
                ThreadProgress {
                    states: history
                        .occurrences
                        .iter()
                        .map(|t| t.and_then(|t| t.state))
                        .collect(),
                    identity: history.identity,
                    class,
                }
            })
            .collect()
    } else {
        let last_index = ctx.snapshot_count() - 1;
        ctx.filtered_threads(ctx.last())
            .into_iter()
            .map(|t| {
                let mut states = vec![None; last_index + 1];
                states[last_index] = t.state;
                ThreadProgress {
                    identity: ThreadIdentity::of(t),
                    class: classify_single(t),
                    states,
                }
            })
            .collect()
    };

    let count = |class: ProgressClass| threads.iter().filter(|t| t.class == class).count();
    let stats = ProgressSummary {
        total: threads.len(),
        active: count(ProgressClass::Active),
        no_progress: count(ProgressClass::RunnableNoProgress),
        blocked: count(ProgressClass::BlockedOnLock),
        stuck: count(ProgressClass::Stuck),
        waiting: count(ProgressClass::WaitingExpected) + count(ProgressClass::TimedWaitingExpected),
    };

    ProgressReport {
        threads,
        stats,
        temporal,
    }
}
