//! Executor and worker pools recognised by thread name, and how busy they are.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use facet::Facet;
use regex::Regex;
use stallscope_types::{ThreadRecord, ThreadState};

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::analyzers::percent;
use crate::context::CorrelationContext;
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};

const EXHAUSTED_PCT: f64 = 95.0;
const IDLE_PCT: f64 = 10.0;
const BLOCKED_THREADS: usize = 3;

/// Tried in order; the first match names the pool.
static POOL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"pool-(\d+)-thread-(\d+)",
        r"ForkJoinPool[-.](\d+)-worker-(\d+)",
        r"ForkJoinPool\.commonPool-worker-(\d+)",
        r"scheduling-(\d+)",
        r"Timer-(\d+)",
        r"(\w+)-pool-(\d+)-thread-(\d+)",
        r"(\w+)ThreadPool-(\d+)",
        r"(\w+)-worker-(\d+)",
    ]
    .into_iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
static TRAILING_INDEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-\d+$").unwrap());
static TRAILING_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-?\d+$").unwrap());

const POOLISH_WORDS: &[&str] = &["pool", "Pool", "worker", "Worker", "executor", "Executor"];

/// One pool in one snapshot.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct PoolSnapshot {
    pub pool: String,
    pub snapshot_index: usize,
    pub timestamp_ms: i64,
    pub total: usize,
    pub runnable: usize,
    pub waiting: usize,
    pub blocked: usize,
    pub timed_waiting: usize,
    pub cpu_ms: f64,
}

impl PoolSnapshot {
    /// Runnable or blocked: threads holding a task.
    pub fn active(&self) -> usize {
        self.runnable + self.blocked
    }

    pub fn idle(&self) -> usize {
        self.waiting + self.timed_waiting
    }

    pub fn utilization_pct(&self) -> f64 {
        percent(self.active(), self.total)
    }

    pub fn is_exhausted(&self) -> bool {
        self.total > 0 && self.utilization_pct() >= EXHAUSTED_PCT
    }
}

#[derive(Facet, Clone, Debug, Default, PartialEq)]
pub struct PoolSummary {
    pub pool_count: usize,
    /// Pool threads in the first snapshot.
    pub total_pool_threads: usize,
    pub exhausted_pools: usize,
    pub idle_pools: usize,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ThreadPoolReport {
    /// Snapshot order, pools in first-seen order within each snapshot.
    pub pools: Vec<PoolSnapshot>,
    pub stats: PoolSummary,
}

impl ThreadPoolReport {
    /// Snapshots of each pool, keyed by pool name.
    pub fn by_pool(&self) -> BTreeMap<&str, Vec<&PoolSnapshot>> {
        group_by_pool(&self.pools)
    }

    pub fn summary(&self) -> String {
        if self.stats.pool_count == 0 {
            "No thread pools detected".to_string()
        } else if self.stats.exhausted_pools > 0 {
            format!(
                "{} pools ({} exhausted)",
                self.stats.pool_count, self.stats.exhausted_pools
            )
        } else {
            format!(
                "{} pools with {} threads",
                self.stats.pool_count, self.stats.total_pool_threads
            )
        }
    }
}

pub struct ThreadPoolAnalyzer;

impl ThreadPoolAnalyzer {
    pub const NAME: &'static str = "thread-pool";
}

impl Analyzer for ThreadPoolAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Analyzes thread pool behavior, utilization, and health"
    }

    fn priority(&self) -> i32 {
        45
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let mut pools: Vec<PoolSnapshot> = Vec::new();
        for (index, snapshot) in ctx.snapshots().iter().enumerate() {
            let mut members: Vec<(String, Vec<&ThreadRecord>)> = Vec::new();
            for thread in ctx.filtered_threads(snapshot) {
                let Some(pool) = thread.name.as_deref().and_then(pool_name) else {
                    continue;
                };
                match members.iter_mut().find(|(name, _)| *name == pool) {
                    Some((_, threads)) => threads.push(thread),
                    None => members.push((pool, vec![thread])),
                }
            }
            pools.extend(
                members
                    .into_iter()
                    .map(|(pool, threads)| measure(pool, &threads, index, snapshot.timestamp_ms)),
            );
        }

        let by_pool = group_by_pool(&pools);

        let mut findings = Vec::new();
        for (pool, snapshots) in &by_pool {
            if let Some(s) = snapshots.iter().find(|s| s.is_exhausted()) {
                findings.push(
                    Finding::builder(
                        Severity::Warning,
                        "pool-exhausted",
                        format!(
                            "Thread pool '{pool}' exhausted: {}/{} active ({:.0}%)",
                            s.active(),
                            s.total,
                            s.utilization_pct()
                        ),
                    )
                    .detail("pool", &pool.to_string())
                    .detail("snapshot_index", &s.snapshot_index)
                    .build(),
                );
            }
            let max_blocked = snapshots.iter().map(|s| s.blocked).max().unwrap_or(0);
            if max_blocked >= BLOCKED_THREADS {
                findings.push(
                    Finding::builder(
                        Severity::Warning,
                        "pool-blocked",
                        format!("Thread pool '{pool}' has {max_blocked} blocked threads"),
                    )
                    .detail("pool", &pool.to_string())
                    .detail("blocked_threads", &max_blocked)
                    .build(),
                );
            }
        }

        let stats = PoolSummary {
            pool_count: by_pool.len(),
            total_pool_threads: pools
                .iter()
                .filter(|s| s.snapshot_index == 0)
                .map(|s| s.total)
                .sum(),
            exhausted_pools: by_pool
                .values()
                .filter(|s| s.iter().any(|s| s.utilization_pct() >= EXHAUSTED_PCT))
                .count(),
            idle_pools: by_pool
                .values()
                .filter(|s| s.iter().all(|s| s.utilization_pct() <= IDLE_PCT))
                .count(),
        };

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::ThreadPool(ThreadPoolReport { pools, stats }),
        ))
    }
}

fn group_by_pool(pools: &[PoolSnapshot]) -> BTreeMap<&str, Vec<&PoolSnapshot>> {
    let mut out: BTreeMap<&str, Vec<&PoolSnapshot>> = BTreeMap::new();
    for snapshot in pools {
        out.entry(snapshot.pool.as_str()).or_default().push(snapshot);
    }
    out
}

/// Pool a thread belongs to, judged by its name alone.
pub fn pool_name(name: &str) -> Option<String> {
    for pattern in POOL_PATTERNS.iter() {
        let Some(caps) = pattern.captures(name) else {
            continue;
        };
        let group = |i: usize| caps.get(i).map_or("", |m| m.as_str());
        if name.starts_with("pool-") && caps.len() > 2 {
            return Some(format!("pool-{}", group(1)));
        }
        if name.starts_with("ForkJoinPool") {
            if name.contains("commonPool") {
                return Some("ForkJoinPool.commonPool".to_string());
            }
            return Some(format!("ForkJoinPool-{}", group(1)));
        }
        return Some(TRAILING_INDEX.replace(group(0), "").into_owned());
    }
    if POOLISH_WORDS.iter().any(|w| name.contains(w)) {
        return Some(TRAILING_NUMBER.replace(name, "").into_owned());
    }
    None
}

fn measure(
    pool: String,
    threads: &[&ThreadRecord],
    snapshot_index: usize,
    timestamp_ms: i64,
) -> PoolSnapshot {
    let count = |state: ThreadState| threads.iter().filter(|t| t.is_in(state)).count();
    PoolSnapshot {
        pool,
        snapshot_index,
        timestamp_ms,
        total: threads.len(),
        runnable: count(ThreadState::Runnable),
        waiting: count(ThreadState::Waiting),
        blocked: count(ThreadState::Blocked),
        timed_waiting: count(ThreadState::TimedWaiting),
        cpu_ms: threads.iter().filter_map(|t| t.cpu_time_ms).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::test_support::*;

    fn report(result: &AnalysisResult) -> &ThreadPoolReport {
        match &result.payload {
            ResultPayload::ThreadPool(r) => r,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn pool_names() {
        assert_eq!(pool_name("pool-3-thread-7").as_deref(), Some("pool-3"));
        assert_eq!(
            pool_name("ForkJoinPool-2-worker-5").as_deref(),
            Some("ForkJoinPool-2")
        );
        assert_eq!(
            pool_name("ForkJoinPool.commonPool-worker-1").as_deref(),
            Some("ForkJoinPool.commonPool")
        );
        assert_eq!(pool_name("Timer-0").as_deref(), Some("Timer"));
        assert_eq!(pool_name("scheduling-1").as_deref(), Some("scheduling"));
        assert_eq!(pool_name("http-worker-12").as_deref(), Some("http-worker"));
        assert_eq!(pool_name("grpcThreadPool-4").as_deref(), Some("grpcThreadPool"));
        assert_eq!(pool_name("ioExecutor7").as_deref(), Some("ioExecutor"));
        assert_eq!(pool_name("main"), None);
    }

    #[test]
    fn fully_busy_pool_is_exhausted() {
        let threads = vec![
            thread("pool-1-thread-1", ThreadState::Runnable),
            thread("pool-1-thread-2", ThreadState::Blocked),
            thread("pool-1-thread-3", ThreadState::Blocked),
            thread("pool-1-thread-4", ThreadState::Blocked),
        ];
        let c = ctx(vec![snapshot(0, threads)]);
        let result = ThreadPoolAnalyzer.analyze(&c).unwrap();
        let messages: Vec<&str> = result.findings.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Thread pool 'pool-1' exhausted: 4/4 active (100%)",
                "Thread pool 'pool-1' has 3 blocked threads",
            ]
        );
        assert_eq!(result.severity, Severity::Warning);
        assert_eq!(result.summary(), "1 pools (1 exhausted)");
    }

    #[test]
    fn exhaustion_reported_once_per_pool() {
        let busy = || {
            snapshot(
                0,
                vec![
                    thread("pool-1-thread-1", ThreadState::Runnable),
                    thread("pool-1-thread-2", ThreadState::Runnable),
                ],
            )
        };
        let mut later = busy();
        later.timestamp_ms = 1_000;
        let c = ctx(vec![busy(), later]);
        let result = ThreadPoolAnalyzer.analyze(&c).unwrap();
        assert_eq!(
            result
                .findings
                .iter()
                .filter(|f| f.category == "pool-exhausted")
                .count(),
            1
        );
        assert_eq!(report(&result).pools.len(), 2);
    }

    #[test]
    fn idle_pools_are_counted() {
        let threads = vec![
            thread("pool-1-thread-1", ThreadState::Waiting),
            thread("pool-1-thread-2", ThreadState::TimedWaiting),
            thread("Timer-0", ThreadState::Runnable),
        ];
        let c = ctx(vec![snapshot(0, threads)]);
        let result = ThreadPoolAnalyzer.analyze(&c).unwrap();
        let r = report(&result);
        assert_eq!(r.stats.pool_count, 2);
        assert_eq!(r.stats.idle_pools, 1);
        assert_eq!(r.stats.exhausted_pools, 1);
        assert_eq!(r.stats.total_pool_threads, 3);
        assert_eq!(r.pools[0].idle(), 2);
    }

    #[test]
    fn no_pools() {
        let c = ctx(vec![snapshot(0, vec![thread("main", ThreadState::Runnable)])]);
        let result = ThreadPoolAnalyzer.analyze(&c).unwrap();
        assert_eq!(result.summary(), "No thread pools detected");
        assert_eq!(result.severity, Severity::Ok);
    }
}
