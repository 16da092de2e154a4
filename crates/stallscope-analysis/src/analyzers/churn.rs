//! Thread creation and destruction between consecutive snapshots.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use facet::Facet;
use regex::Regex;

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::context::CorrelationContext;
use crate::identity::ThreadIdentity;
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};

static EXECUTOR_THREAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(pool-\d+)-thread-\d+$").unwrap());
static FORK_JOIN_WORKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(ForkJoinPool.*)-worker-\d+$").unwrap());
static NUMBERED_THREAD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.*)-\d+$").unwrap());

/// Pool name of a numbered thread: `pool-3-thread-7` is in `pool-3`,
/// `http-nio-8080-exec-12` is in `http-nio-8080-exec`.
pub fn pool_prefix(name: &str) -> Option<&str> {
    [&EXECUTOR_THREAD, &FORK_JOIN_WORKER, &NUMBERED_THREAD]
        .into_iter()
        .find_map(|re| re.captures(name)?.get(1))
        .map(|m| m.as_str())
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ChurnEvent {
    pub from_snapshot: usize,
    pub to_snapshot: usize,
    pub from_timestamp_ms: i64,
    pub to_timestamp_ms: i64,
    #[facet(default)]
    pub created: Vec<ThreadIdentity>,
    #[facet(default)]
    pub destroyed: Vec<ThreadIdentity>,
}

impl ChurnEvent {
    pub fn net_change(&self) -> i64 {
        self.created.len() as i64 - self.destroyed.len() as i64
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ChurnSummary {
    pub first_count: usize,
    pub last_count: usize,
    pub net_growth: i64,
    pub total_created: usize,
    pub total_destroyed: usize,
    /// Threads per second over the whole run.
    pub growth_rate: f64,
    pub potential_leak: bool,
    pub high_churn: bool,
}

impl ChurnSummary {
    /// Created plus destroyed, relative to the first count.
    pub fn churn_rate(&self) -> f64 {
        if self.first_count == 0 {
            0.0
        } else {
            (self.total_created + self.total_destroyed) as f64 / self.first_count as f64
        }
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ChurnReport {
    /// Filtered thread count per snapshot.
    pub thread_counts: Vec<usize>,
    #[facet(default)]
    pub events: Vec<ChurnEvent>,
    /// Growth per pool prefix between the first and last snapshot.
    #[facet(default)]
    pub pool_growth: BTreeMap<String, usize>,
    pub stats: ChurnSummary,
}

impl ChurnReport {
    pub fn summary(&self) -> String {
        let s = &self.stats;
        if s.potential_leak {
            format!(
                "Thread leak detected: {} → {} (+{})",
                s.first_count, s.last_count, s.net_growth
            )
        } else if s.high_churn {
            format!(
                "High thread churn: {} created, {} destroyed",
                s.total_created, s.total_destroyed
            )
        } else {
            format!("Thread count stable: {} → {}", s.first_count, s.last_count)
        }
    }
}

pub struct ThreadChurnAnalyzer;

impl ThreadChurnAnalyzer {
    pub const NAME: &'static str = "thread-churn";
}

impl Analyzer for ThreadChurnAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Detects thread creation/destruction patterns to identify leaks or churn"
    }

    fn priority(&self) -> i32 {
        60
    }

    fn requires_multiple_snapshots(&self) -> bool {
        true
    }

    fn can_analyze(&self, ctx: &CorrelationContext) -> bool {
        ctx.is_multi() && ctx.options().toggles().track_thread_churn
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let sets: Vec<Vec<ThreadIdentity>> = ctx
            .snapshots()
            .iter()
            .map(|s| distinct(ctx.filtered_threads(s).into_iter().map(ThreadIdentity::of)))
            .collect();
        let thread_counts: Vec<usize> = sets.iter().map(Vec::len).collect();
        let (Some(first_set), Some(last_set)) = (sets.first(), sets.last()) else {
            return Err(AnalyzerError::new("no snapshots"));
        };

        let mut events = Vec::new();
        let (mut total_created, mut total_destroyed) = (0, 0);
        for (i, pair) in sets.windows(2).enumerate() {
            let created = missing_from(&pair[1], &pair[0]);
            let destroyed = missing_from(&pair[0], &pair[1]);
            total_created += created.len();
            total_destroyed += destroyed.len();
            if !created.is_empty() || !destroyed.is_empty() {
                events.push(ChurnEvent {
                    from_snapshot: i,
                    to_snapshot: i + 1,
                    from_timestamp_ms: ctx.snapshots()[i].timestamp_ms,
                    to_timestamp_ms: ctx.snapshots()[i + 1].timestamp_ms,
                    created,
                    destroyed,
                });
            }
        }

        let first_count = first_set.len();
        let last_count = last_set.len();
        let net_growth = last_count as i64 - first_count as i64;
        let span_secs = ctx.time_span_ms() as f64 / 1000.0;
        let growth_rate = if span_secs > 0.0 {
            net_growth as f64 / span_secs
        } else {
            0.0
        };
        let monotonic = thread_counts.windows(2).all(|w| w[1] >= w[0]);
        let stats = ChurnSummary {
            first_count,
            last_count,
            net_growth,
            total_created,
            total_destroyed,
            growth_rate,
            potential_leak: net_growth > 0 && monotonic,
            high_churn: total_created > first_count || total_destroyed > first_count,
        };

        let mut findings = Vec::new();
        if stats.potential_leak {
            let severity = if net_growth >= 10 {
                Severity::Warning
            } else {
                Severity::Info
            };
            findings.push(
                Finding::builder(
                    severity,
                    "thread-growth",
                    format!(
                        "Thread count grew from {first_count} to {last_count} (+{net_growth}, {growth_rate:.2}/sec)"
                    ),
                )
                .detail("first_count", &first_count)
                .detail("last_count", &last_count)
                .detail("net_growth", &net_growth)
                .detail("growth_rate", &growth_rate)
                .build(),
            );
        }
        if stats.high_churn {
            findings.push(
                Finding::builder(
                    Severity::Info,
                    "thread-churn",
                    format!(
                        "High thread churn: {total_created} created, {total_destroyed} destroyed"
                    ),
                )
                .detail("total_created", &total_created)
                .detail("total_destroyed", &total_destroyed)
                .build(),
            );
        }

        let pool_growth = pool_growth(first_set, last_set);
        for (pool, &growth) in &pool_growth {
            if growth < 5 {
                continue;
            }
            let severity = if growth >= 10 {
                Severity::Warning
            } else {
                Severity::Info
            };
            findings.push(
                Finding::builder(
                    severity,
                    "pool-growth",
                    format!("Thread pool '{pool}' grew by {growth} threads"),
                )
                .detail("pool_name", pool)
                .detail("growth", &growth)
                .build(),
            );
        }

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::ThreadChurn(ChurnReport {
                thread_counts,
                events,
                pool_growth,
                stats,
            }),
        ))
    }
}

/// Identities in order, dropping ones that match an earlier entry.
fn distinct(ids: impl Iterator<Item = ThreadIdentity>) -> Vec<ThreadIdentity> {
    let mut out: Vec<ThreadIdentity> = Vec::new();
    for id in ids {
        if !out.iter().any(|seen| seen.matches(&id)) {
            out.push(id);
        }
    }
    out
}

/// Entries of `these` with no match in `others`.
fn missing_from(these: &[ThreadIdentity], others: &[ThreadIdentity]) -> Vec<ThreadIdentity> {
    these
        .iter()
        .filter(|id| !others.iter().any(|o| o.matches(id)))
        .cloned()
        .collect()
}

fn count_by_pool(ids: &[ThreadIdentity]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for name in ids.iter().filter_map(|id| id.name.as_deref()) {
        if let Some(pool) = pool_prefix(name) {
            *counts.entry(pool).or_default() += 1;
        }
    }
    counts
}

fn pool_growth(first: &[ThreadIdentity], last: &[ThreadIdentity]) -> BTreeMap<String, usize> {
    let before = count_by_pool(first);
    count_by_pool(last)
        .into_iter()
        .filter_map(|(pool, count)| {
            let prior = before.get(pool).copied().unwrap_or(0);
            (count > prior).then(|| (pool.to_string(), count - prior))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use stallscope_types::{ThreadRecord, ThreadState};

    use super::*;
    use crate::analyzers::test_support::*;

    fn pool_threads(pool: usize, count: usize) -> Vec<ThreadRecord> {
        (1..=count)
            .map(|i| thread(&format!("pool-{pool}-thread-{i}"), ThreadState::Waiting))
            .collect()
    }

    fn report(result: &AnalysisResult) -> &ChurnReport {
        match &result.payload {
            ResultPayload::ThreadChurn(r) => r,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn pool_prefixes() {
        assert_eq!(pool_prefix("pool-3-thread-7"), Some("pool-3"));
        assert_eq!(pool_prefix("ForkJoinPool-1-worker-5"), Some("ForkJoinPool-1"));
        assert_eq!(pool_prefix("http-nio-8080-exec-12"), Some("http-nio-8080-exec"));
        assert_eq!(pool_prefix("main"), None);
    }

    #[test]
    fn requires_several_snapshots() {
        let single = ctx(vec![snapshot(0, pool_threads(1, 2))]);
        assert!(!ThreadChurnAnalyzer.can_analyze(&single));
        let multi = ctx(vec![
            snapshot(0, pool_threads(1, 2)),
            snapshot(1_000, pool_threads(1, 2)),
        ]);
        assert!(ThreadChurnAnalyzer.can_analyze(&multi));
    }

    #[test]
    fn growth_rate_uses_fractional_seconds() {
        let c = ctx(vec![
            snapshot(0, pool_threads(1, 2)),
            snapshot(1_500, pool_threads(1, 5)),
        ]);
        let result = ThreadChurnAnalyzer.analyze(&c).unwrap();
        assert_eq!(report(&result).stats.growth_rate, 2.0);
    }

    #[test]
    fn monotonic_growth_is_a_potential_leak() {
        let c = ctx(vec![
            snapshot(0, pool_threads(1, 2)),
            snapshot(5_000, pool_threads(1, 8)),
            snapshot(10_000, pool_threads(1, 14)),
        ]);
        let result = ThreadChurnAnalyzer.analyze(&c).unwrap();
        let r = report(&result);
        assert_eq!(r.thread_counts, vec![2, 8, 14]);
        assert!(r.stats.potential_leak);
        assert_eq!(r.stats.net_growth, 12);
        assert_eq!(r.stats.growth_rate, 1.2);
        assert_eq!(r.pool_growth.get("pool-1"), Some(&12));
        assert_eq!(r.events.len(), 2);
        assert_eq!(r.events[0].created.len(), 6);

        let categories: Vec<&str> = result.findings.iter().map(|f| f.category.as_str()).collect();
        assert_eq!(categories, vec!["thread-growth", "thread-churn", "pool-growth"]);
        assert_eq!(result.severity, Severity::Warning);
        assert_eq!(result.summary(), "Thread leak detected: 2 → 14 (+12)");
    }

    #[test]
    fn stable_set_has_no_findings() {
        let c = ctx(vec![
            snapshot(0, pool_threads(1, 4)),
            snapshot(1_000, pool_threads(1, 4)),
        ]);
        let result = ThreadChurnAnalyzer.analyze(&c).unwrap();
        assert!(result.findings.is_empty());
        assert!(report(&result).events.is_empty());
        assert_eq!(result.summary(), "Thread count stable: 4 → 4");
    }

    #[test]
    fn full_turnover_is_high_churn() {
        let c = ctx(vec![
            snapshot(0, vec![thread("a", ThreadState::Runnable)]),
            snapshot(1_000, vec![thread("b", ThreadState::Runnable)]),
        ]);
        let result = ThreadChurnAnalyzer.analyze(&c).unwrap();
        let r = report(&result);
        assert!(r.stats.high_churn);
        assert!(!r.stats.potential_leak);
        assert_eq!(r.stats.churn_rate(), 2.0);
        assert_eq!(result.summary(), "High thread churn: 1 created, 1 destroyed");
    }
}
