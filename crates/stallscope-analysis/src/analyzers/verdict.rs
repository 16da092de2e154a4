//! Top-line health verdict: one item per concern, an overall status, where
//! thread time goes, and for multi-snapshot runs a per-snapshot health score.

use std::collections::{BTreeMap, HashMap};

use facet::Facet;
use facet_value::Value;
use stallscope_types::{Snapshot, ThreadRecord, ThreadState};

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::analyzers::deadlock::{find_lock_cycles, reported_thread_names};
use crate::analyzers::gc::is_gc_worker;
use crate::analyzers::io_block::classify_stack;
use crate::analyzers::percent;
use crate::analyzers::thread_pool::pool_name;
use crate::context::CorrelationContext;
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};

const TREND_POINTS: f64 = 10.0;
const CRITICAL_DROP_POINTS: f64 = 20.0;
const HOT_LOCK_WAITERS: usize = 3;
const HEAVY_LOCK_WAITERS: usize = 5;
const LARGE_POOL: usize = 50;
const IO_HEAVY_THREADS: usize = 10;
const GC_HEAVY_PCT: f64 = 30.0;
const CHURN_FRACTION: f64 = 0.2;

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum VerdictStatus {
    Healthy,
    SuspectedStall,
    Deadlock,
    HighContention,
    IoBound,
    GcPressure,
}

impl VerdictStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictStatus::Healthy => "HEALTHY",
            VerdictStatus::SuspectedStall => "SUSPECTED_STALL",
            VerdictStatus::Deadlock => "DEADLOCK",
            VerdictStatus::HighContention => "HIGH_CONTENTION",
            VerdictStatus::IoBound => "IO_BOUND",
            VerdictStatus::GcPressure => "GC_PRESSURE",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            VerdictStatus::Healthy => "Application appears healthy",
            VerdictStatus::SuspectedStall => "Application may be stalled",
            VerdictStatus::Deadlock => "Deadlock detected",
            VerdictStatus::HighContention => "High lock contention",
            VerdictStatus::IoBound => "Application is I/O bound",
            VerdictStatus::GcPressure => "GC pressure detected",
        }
    }
}

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthStatus {
    pub fn of(score: f64) -> Self {
        if score >= 90.0 {
            HealthStatus::Excellent
        } else if score >= 75.0 {
            HealthStatus::Good
        } else if score >= 60.0 {
            HealthStatus::Fair
        } else if score >= 40.0 {
            HealthStatus::Poor
        } else {
            HealthStatus::Critical
        }
    }
}

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum HealthTrend {
    Degrading,
    Improving,
    Stable,
}

/// One concern the verdict looked at.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct VerdictItem {
    pub category: String,
    pub summary: String,
    pub severity: Severity,
    #[facet(default)]
    pub details: BTreeMap<String, Value>,
}

impl VerdictItem {
    fn new(category: &str, summary: impl Into<String>, severity: Severity) -> Self {
        Self {
            category: category.to_string(),
            summary: summary.into(),
            severity,
            details: BTreeMap::new(),
        }
    }

    fn detail<V>(mut self, key: &str, value: &V) -> Self
    where
        V: for<'facet> Facet<'facet>,
    {
        let value = facet_value::to_value(value).unwrap_or(Value::NULL);
        self.details.insert(key.to_string(), value);
        self
    }

    /// `Thread Pools` becomes `verdict-thread-pools`.
    fn finding_category(&self) -> String {
        format!("verdict-{}", self.category.to_lowercase().replace(' ', "-"))
    }
}

/// Share of filtered thread observations per activity, in percent.
#[derive(Facet, Clone, Debug, Default, PartialEq)]
pub struct TimeDistribution {
    pub running: f64,
    pub blocked: f64,
    pub waiting: f64,
    pub io: f64,
    pub gc: f64,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct HealthEvolution {
    /// 0 to 100, higher is healthier.
    pub scores: Vec<f64>,
    pub statuses: Vec<HealthStatus>,
    pub category_scores: BTreeMap<String, Vec<f64>>,
    pub first: f64,
    pub last: f64,
    pub change: f64,
    pub change_percent: f64,
    pub trend: HealthTrend,
    /// First snapshot whose score dropped more than 20 points from the one before.
    #[facet(skip_unless_truthy)]
    pub critical_change_at: Option<usize>,
    #[facet(default)]
    pub degrading_categories: Vec<String>,
    #[facet(default)]
    pub improving_categories: Vec<String>,
}

impl HealthEvolution {
    pub fn is_degrading(&self) -> bool {
        self.trend == HealthTrend::Degrading
    }

    pub fn is_improving(&self) -> bool {
        self.trend == HealthTrend::Improving
    }

    pub fn current_status(&self) -> HealthStatus {
        HealthStatus::of(self.last)
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct VerdictReport {
    pub status: VerdictStatus,
    pub items: Vec<VerdictItem>,
    pub time_distribution: TimeDistribution,
    pub snapshot_count: usize,
    /// Filtered threads per snapshot, averaged.
    pub total_threads: usize,
    #[facet(skip_unless_truthy)]
    pub health: Option<HealthEvolution>,
}

impl VerdictReport {
    pub fn summary(&self) -> String {
        format!(
            "VERDICT: {} - {}",
            self.status.as_str(),
            self.status.description()
        )
    }

    pub fn item(&self, category: &str) -> Option<&VerdictItem> {
        self.items.iter().find(|i| i.category == category)
    }
}

pub struct VerdictAnalyzer;

impl VerdictAnalyzer {
    pub const NAME: &'static str = "verdict";
}

impl Analyzer for VerdictAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Provides a high-level verdict on application health based on all available data"
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let mut findings = Vec::new();

        let health = ctx.is_multi().then(|| health_evolution(ctx));
        if let Some(health) = &health {
            if health.is_degrading() {
                findings.push(
                    Finding::builder(
                        Severity::Warning,
                        "degrading-health",
                        format!(
                            "Application health is degrading: {:.0} → {:.0} ({:.0} points)",
                            health.first, health.last, health.change
                        ),
                    )
                    .detail("trend", &health.trend)
                    .build(),
                );
            }
            if let Some(index) = health.critical_change_at {
                findings.push(
                    Finding::builder(
                        Severity::Error,
                        "critical-health-change",
                        format!("Critical health change detected at snapshot {index}"),
                    )
                    .detail("snapshot_index", &index)
                    .build(),
                );
            }
        }

        let (states, total_threads) = thread_states(ctx);
        let deadlocks = deadlocks(ctx);
        let gc = gc_activity(ctx);
        let io = io_blocking(ctx);
        let locks = lock_contention(ctx);
        let pools = thread_pools(ctx);

        let status = if deadlocks.severity == Severity::Critical {
            VerdictStatus::Deadlock
        } else if states.severity == Severity::Error {
            VerdictStatus::SuspectedStall
        } else if gc.severity > Severity::Info {
            VerdictStatus::GcPressure
        } else if io.severity > Severity::Info {
            VerdictStatus::IoBound
        } else if locks.severity > Severity::Info {
            VerdictStatus::HighContention
        } else {
            VerdictStatus::Healthy
        };

        let mut items = vec![states, deadlocks, gc, io, locks, pools];
        if ctx.is_multi() {
            items.push(thread_churn(ctx));
        }

        findings.extend(
            items
                .iter()
                .filter(|item| item.severity > Severity::Ok)
                .map(|item| {
                    Finding::builder(
                        item.severity,
                        item.finding_category(),
                        format!("{}: {}", item.category, item.summary),
                    )
                    .build()
                }),
        );

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::Verdict(VerdictReport {
                status,
                items,
                time_distribution: time_distribution(ctx),
                snapshot_count: ctx.snapshot_count(),
                total_threads,
                health,
            }),
        ))
    }
}

// ── Items ───────────────────────────────────────────────────────

fn thread_states(ctx: &CorrelationContext) -> (VerdictItem, usize) {
    let (mut total, mut runnable, mut blocked, mut waiting, mut timed_waiting) = (0, 0, 0, 0, 0);
    for snapshot in ctx.snapshots() {
        for thread in ctx.filtered_threads(snapshot) {
            total += 1;
            match thread.state {
                Some(ThreadState::Runnable) => runnable += 1,
                Some(ThreadState::Blocked) => blocked += 1,
                Some(ThreadState::Waiting) => waiting += 1,
                Some(ThreadState::TimedWaiting) => timed_waiting += 1,
                _ => {}
            }
        }
    }

    let count = ctx.snapshot_count().max(1);
    let (total, runnable, blocked, waiting, timed_waiting) = (
        total / count,
        runnable / count,
        blocked / count,
        waiting / count,
        timed_waiting / count,
    );

    let blocked_pct = percent(blocked, total);
    let (summary, severity) = if blocked_pct > 50.0 {
        (format!("Critical: {blocked_pct:.0}% threads blocked"), Severity::Error)
    } else if blocked_pct > 20.0 {
        (format!("Warning: {blocked_pct:.0}% threads blocked"), Severity::Warning)
    } else {
        (
            format!(
                "{total} threads: {runnable} runnable, {blocked} blocked, {} waiting",
                waiting + timed_waiting
            ),
            Severity::Ok,
        )
    };

    let item = VerdictItem::new("Thread States", summary, severity)
        .detail("total", &total)
        .detail("runnable", &runnable)
        .detail("blocked", &blocked)
        .detail("waiting", &waiting)
        .detail("timed_waiting", &timed_waiting);
    (item, total)
}

/// Runtime-reported deadlocks first, then lock cycles in the filtered view.
fn deadlocks(ctx: &CorrelationContext) -> VerdictItem {
    for snapshot in ctx.snapshots() {
        if !snapshot.reported_deadlocks.is_empty() {
            let count = snapshot.reported_deadlocks.len();
            let threads: Vec<String> = reported_thread_names(snapshot)
                .into_iter()
                .map(str::to_string)
                .collect();
            return VerdictItem::new(
                "Deadlocks",
                format!("{count} deadlock(s) detected!"),
                Severity::Critical,
            )
            .detail("count", &count)
            .detail("threads", &threads);
        }
    }

    if ctx.options().toggles().detect_deadlocks {
        for snapshot in ctx.snapshots() {
            let cycles = find_lock_cycles(&ctx.filtered_threads(snapshot));
            if !cycles.is_empty() {
                let threads: Vec<String> =
                    cycles.iter().flat_map(|c| c.threads.iter().cloned()).collect();
                return VerdictItem::new(
                    "Deadlocks",
                    format!("{} deadlock(s) detected!", cycles.len()),
                    Severity::Critical,
                )
                .detail("count", &cycles.len())
                .detail("threads", &threads);
            }
        }
    }

    VerdictItem::new("Deadlocks", "No deadlocks", Severity::Ok)
}

/// Runtime-internal threads count here, so this reads every thread.
fn gc_activity(ctx: &CorrelationContext) -> VerdictItem {
    let (mut gc_threads, mut total) = (0, 0);
    for snapshot in ctx.snapshots() {
        total += snapshot.threads.len();
        gc_threads += snapshot
            .threads
            .iter()
            .filter(|t| t.name.as_deref().is_some_and(is_gc_worker))
            .count();
    }
    let count = ctx.snapshot_count().max(1);
    let (gc_threads, total) = (gc_threads / count, total / count);

    let gc_pct = percent(gc_threads, total);
    if gc_pct > GC_HEAVY_PCT {
        VerdictItem::new("GC Activity", "High GC thread activity", Severity::Warning)
            .detail("gc_threads", &gc_threads)
            .detail("percent", &gc_pct)
    } else {
        VerdictItem::new(
            "GC Activity",
            format!("{gc_threads} GC threads active"),
            Severity::Ok,
        )
        .detail("gc_threads", &gc_threads)
    }
}

fn in_io(thread: &ThreadRecord) -> bool {
    classify_stack(&thread.stack).is_some()
}

fn io_blocking(ctx: &CorrelationContext) -> VerdictItem {
    let in_io_total: usize = ctx
        .snapshots()
        .iter()
        .map(|s| ctx.filtered_threads(s).into_iter().filter(|t| in_io(t)).count())
        .sum();
    let average = in_io_total / ctx.snapshot_count().max(1);

    if average > IO_HEAVY_THREADS {
        VerdictItem::new(
            "I/O Status",
            format!("{average} threads blocked on I/O"),
            Severity::Warning,
        )
        .detail("blocked", &average)
    } else if average > 0 {
        VerdictItem::new("I/O Status", format!("{average} threads in I/O"), Severity::Info)
            .detail("blocked", &average)
    } else {
        VerdictItem::new("I/O Status", "No I/O blocking", Severity::Ok)
    }
}

/// Waiters are counted across all snapshots, so a lock contended over
/// time weighs more than one contended once.
fn lock_contention(ctx: &CorrelationContext) -> VerdictItem {
    let mut waiters: HashMap<&str, usize> = HashMap::new();
    for snapshot in ctx.snapshots() {
        for thread in ctx.filtered_threads(snapshot) {
            if let Some(lock) = thread.awaited_lock() {
                *waiters.entry(lock).or_default() += 1;
            }
        }
    }

    let hot_locks = waiters.values().filter(|&&n| n >= HOT_LOCK_WAITERS).count();
    let max_waiters = waiters.values().copied().max().unwrap_or(0);
    if hot_locks == 0 {
        return VerdictItem::new("Lock Contention", "No significant contention", Severity::Ok);
    }
    let severity = if max_waiters >= HEAVY_LOCK_WAITERS {
        Severity::Warning
    } else {
        Severity::Info
    };
    VerdictItem::new(
        "Lock Contention",
        format!("{hot_locks} hot lock(s), max {max_waiters} waiters"),
        severity,
    )
    .detail("hot_locks", &hot_locks)
    .detail("max_waiters", &max_waiters)
}

fn thread_pools(ctx: &CorrelationContext) -> VerdictItem {
    let mut sizes: HashMap<String, usize> = HashMap::new();
    for snapshot in ctx.snapshots() {
        for name in snapshot.threads.iter().filter_map(|t| t.name.as_deref()) {
            if let Some(pool) = pool_name(name) {
                *sizes.entry(pool).or_default() += 1;
            }
        }
    }

    let pools = sizes.len();
    let largest = sizes.values().copied().max().unwrap_or(0);
    if largest > LARGE_POOL {
        VerdictItem::new(
            "Thread Pools",
            format!("{pools} pools, largest has {largest} threads"),
            Severity::Info,
        )
        .detail("pools", &pools)
        .detail("max_size", &largest)
    } else {
        VerdictItem::new("Thread Pools", format!("{pools} thread pool(s)"), Severity::Ok)
            .detail("pools", &pools)
    }
}

fn thread_churn(ctx: &CorrelationContext) -> VerdictItem {
    let first = ctx.first().threads.len();
    let last = ctx.last().threads.len();
    let change = last as i64 - first as i64;

    if change.unsigned_abs() as f64 > first as f64 * CHURN_FRACTION {
        let severity = if change > 0 {
            Severity::Warning
        } else {
            Severity::Info
        };
        VerdictItem::new(
            "Thread Churn",
            format!("Thread count: {first} → {last}"),
            severity,
        )
        .detail("first", &first)
        .detail("last", &last)
        .detail("change", &change)
    } else {
        VerdictItem::new(
            "Thread Churn",
            format!("Thread count stable: {first} → {last}"),
            Severity::Ok,
        )
        .detail("first", &first)
        .detail("last", &last)
    }
}

fn time_distribution(ctx: &CorrelationContext) -> TimeDistribution {
    let (mut running, mut blocked, mut waiting, mut io, mut gc) = (0, 0, 0, 0, 0);
    for snapshot in ctx.snapshots() {
        for thread in ctx.filtered_threads(snapshot) {
            if thread.name.as_deref().is_some_and(is_gc_worker) {
                gc += 1;
            } else if in_io(thread) {
                io += 1;
            } else {
                match thread.state {
                    Some(ThreadState::Blocked) => blocked += 1,
                    Some(ThreadState::Waiting | ThreadState::TimedWaiting) => waiting += 1,
                    Some(ThreadState::Runnable) => running += 1,
                    _ => {}
                }
            }
        }
    }
    let total = running + blocked + waiting + io + gc;
    TimeDistribution {
        running: percent(running, total),
        blocked: percent(blocked, total),
        waiting: percent(waiting, total),
        io: percent(io, total),
        gc: percent(gc, total),
    }
}

// ── Health score ────────────────────────────────────────────────

fn gc_thread_count(snapshot: &Snapshot) -> usize {
    snapshot
        .threads
        .iter()
        .filter(|t| t.name.as_deref().is_some_and(is_gc_worker))
        .count()
}

/// 0 to 100 for one snapshot; 50 when no thread passes the filter.
fn health_score(ctx: &CorrelationContext, snapshot: &Snapshot) -> f64 {
    let threads = ctx.filtered_threads(snapshot);
    let total = threads.len();
    if total == 0 {
        return 50.0;
    }

    let blocked = threads.iter().filter(|t| t.is_in(ThreadState::Blocked)).count();
    let waiting = threads
        .iter()
        .filter(|t| t.state.is_some_and(ThreadState::is_waiting))
        .count();
    let lock_waiters = threads.iter().filter(|t| t.awaited_lock().is_some()).count();

    let mut score = 100.0;
    score -= match percent(blocked, total) {
        p if p > 50.0 => 40.0,
        p if p > 30.0 => 25.0,
        p if p > 10.0 => 10.0,
        _ => 0.0,
    };
    score -= match percent(waiting, total) {
        p if p > 70.0 => 20.0,
        p if p > 50.0 => 10.0,
        _ => 0.0,
    };
    score -= 5.0 * lock_waiters as f64;
    if gc_thread_count(snapshot) as f64 > total as f64 * 0.15 {
        score -= 15.0;
    }
    score.clamp(0.0, 100.0)
}

fn category_scores(ctx: &CorrelationContext, snapshot: &Snapshot) -> Vec<(&'static str, f64)> {
    let threads = ctx.filtered_threads(snapshot);
    let total = threads.len();
    if total == 0 {
        return Vec::new();
    }
    let blocked = threads.iter().filter(|t| t.is_in(ThreadState::Blocked)).count();
    let lock_waiters = threads.iter().filter(|t| t.awaited_lock().is_some()).count();
    // GC threads weigh five times as much as their share.
    let gc = 100.0 - percent(gc_thread_count(snapshot), total) * 5.0;
    vec![
        ("Thread States", (100.0 - percent(blocked, total)).max(0.0)),
        ("Lock Contention", (100.0 - percent(lock_waiters, total)).max(0.0)),
        ("GC Activity", gc.clamp(0.0, 100.0)),
    ]
}

fn health_evolution(ctx: &CorrelationContext) -> HealthEvolution {
    let mut scores = Vec::with_capacity(ctx.snapshot_count());
    let mut per_category: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for snapshot in ctx.snapshots() {
        scores.push(health_score(ctx, snapshot));
        for (category, score) in category_scores(ctx, snapshot) {
            per_category
                .entry(category.to_string())
                .or_default()
                .push(score);
        }
    }

    let first = scores.first().copied().unwrap_or(50.0);
    let last = scores.last().copied().unwrap_or(50.0);
    let change = last - first;
    let trend = if change < -TREND_POINTS {
        HealthTrend::Degrading
    } else if change > TREND_POINTS {
        HealthTrend::Improving
    } else {
        HealthTrend::Stable
    };
    let critical_change_at = scores
        .windows(2)
        .position(|w| w[1] - w[0] < -CRITICAL_DROP_POINTS)
        .map(|i| i + 1);

    let mut degrading_categories = Vec::new();
    let mut improving_categories = Vec::new();
    for (category, series) in &per_category {
        if let [first, .., last] = series.as_slice() {
            let delta = last - first;
            if delta < -TREND_POINTS {
                degrading_categories.push(category.clone());
            } else if delta > TREND_POINTS {
                improving_categories.push(category.clone());
            }
        }
    }

    HealthEvolution {
        statuses: scores.iter().map(|&s| HealthStatus::of(s)).collect(),
        scores,
        category_scores: per_category,
        first,
        last,
        change,
        change_percent: if first > 0.0 { change / first * 100.0 } else { 0.0 },
        trend,
        critical_change_at,
        degrading_categories,
        improving_categories,
    }
}

#[cfg(test)]
mod tests {
    use stallscope_types::{DeadlockedThread, LockKind, LockRecord, ReportedDeadlock};

    use super::*;
    use crate::analyzers::test_support::*;

    fn report(result: &AnalysisResult) -> &VerdictReport {
        match &result.payload {
            ResultPayload::Verdict(r) => r,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    fn waiting_for(name: &str, lock: &str) -> ThreadRecord {
        ThreadRecord {
            waiting_on: Some(lock.to_string()),
            ..thread(name, ThreadState::Blocked)
        }
    }

    fn running(n: usize) -> Vec<ThreadRecord> {
        (0..n)
            .map(|i| thread(&format!("worker-{i}"), ThreadState::Runnable))
            .collect()
    }

    #[test]
    fn healthy_process() {
        let c = ctx(vec![snapshot(0, running(3))]);
        let result = VerdictAnalyzer.analyze(&c).unwrap();
        let r = report(&result);
        assert_eq!(r.status, VerdictStatus::Healthy);
        assert_eq!(result.summary(), "VERDICT: HEALTHY - Application appears healthy");
        assert!(result.findings.is_empty());
        assert_eq!(result.severity, Severity::Ok);
        assert_eq!(r.items.len(), 6);
        assert_eq!(
            r.item("Thread States").unwrap().summary,
            "3 threads: 3 runnable, 0 blocked, 0 waiting"
        );
        assert_eq!(r.time_distribution.running, 100.0);
        assert!(r.health.is_none());
    }

    #[test]
    fn reported_deadlock_wins() {
        let deadlock = ReportedDeadlock {
            threads: vec![DeadlockedThread::named("a"), DeadlockedThread::named("b")],
        };
        let c = ctx(vec![
            snapshot(0, running(2)).with_reported_deadlocks(vec![deadlock]),
        ]);
        let result = VerdictAnalyzer.analyze(&c).unwrap();
        assert_eq!(report(&result).status, VerdictStatus::Deadlock);
        assert_eq!(result.severity, Severity::Critical);
        assert_eq!(result.findings[0].category, "verdict-deadlocks");
        assert_eq!(
            result.findings[0].message,
            "Deadlocks: 1 deadlock(s) detected!"
        );
    }

    #[test]
    fn lock_cycle_is_a_deadlock() {
        let holder_waiter = |name: &str, holds: &str, waits: &str| ThreadRecord {
            locks: vec![
                LockRecord::new(waits, LockKind::WaitingToLock),
                LockRecord::new(holds, LockKind::Locked),
            ],
            ..thread(name, ThreadState::Blocked)
        };
        let c = ctx(vec![snapshot(
            0,
            vec![holder_waiter("a", "0x1", "0x2"), holder_waiter("b", "0x2", "0x1")],
        )]);
        let result = VerdictAnalyzer.analyze(&c).unwrap();
        assert_eq!(report(&result).status, VerdictStatus::Deadlock);
    }

    #[test]
    fn mostly_blocked_is_a_suspected_stall() {
        let mut threads = running(1);
        threads.extend((0..3).map(|i| thread(&format!("b-{i}"), ThreadState::Blocked)));
        let c = ctx(vec![snapshot(0, threads)]);
        let result = VerdictAnalyzer.analyze(&c).unwrap();
        let r = report(&result);
        assert_eq!(r.status, VerdictStatus::SuspectedStall);
        assert_eq!(r.items[0].summary, "Critical: 75% threads blocked");
        assert_eq!(result.severity, Severity::Error);
        assert_eq!(r.time_distribution.blocked, 75.0);
    }

    #[test]
    fn heavy_contention() {
        let mut threads = running(5);
        threads.extend((0..5).map(|i| waiting_for(&format!("w-{i}"), "0xA")));
        let c = ctx(vec![snapshot(0, threads)]);
        let result = VerdictAnalyzer.analyze(&c).unwrap();
        let r = report(&result);
        assert_eq!(r.status, VerdictStatus::HighContention);
        assert_eq!(
            r.item("Lock Contention").unwrap().summary,
            "1 hot lock(s), max 5 waiters"
        );
    }

    #[test]
    fn degrading_health_across_snapshots() {
        let mut later = running(1);
        later.extend((0..3).map(|i| waiting_for(&format!("w-{i}"), "0xA")));
        let c = ctx(vec![snapshot(0, running(4)), snapshot(1_000, later)]);
        let result = VerdictAnalyzer.analyze(&c).unwrap();
        let r = report(&result);
        let health = r.health.as_ref().unwrap();
        assert_eq!(health.scores, vec![100.0, 45.0]);
        assert_eq!(health.statuses, vec![HealthStatus::Excellent, HealthStatus::Poor]);
        assert!(health.is_degrading());
        assert_eq!(health.critical_change_at, Some(1));
        assert_eq!(health.category_scores.len(), 3);
        assert_eq!(health.category_scores["Thread States"], vec![100.0, 25.0]);
        assert_eq!(health.category_scores["GC Activity"], vec![100.0, 100.0]);
        assert_eq!(
            health.degrading_categories,
            vec!["Lock Contention".to_string(), "Thread States".to_string()]
        );

        let categories: Vec<&str> = result.findings.iter().map(|f| f.category.as_str()).collect();
        assert_eq!(&categories[..2], &["degrading-health", "critical-health-change"]);
        assert_eq!(
            result.findings[0].message,
            "Application health is degrading: 100 → 45 (-55 points)"
        );
        assert_eq!(result.severity, Severity::Error);
        assert_eq!(r.items.len(), 7);
        assert_eq!(
            r.item("Thread Churn").unwrap().summary,
            "Thread count stable: 4 → 4"
        );
    }
}
