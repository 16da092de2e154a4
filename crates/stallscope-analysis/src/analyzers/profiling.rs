//! CPU, allocation, I/O and lock profiles from trace data, correlated with
//! the thread states seen in the last snapshot.

use std::collections::BTreeMap;

use facet::Facet;
use stallscope_types::ThreadState;

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::context::CorrelationContext;
use crate::profile::{
    self, AllocationProfile, IoSummary, IoTargetProfile, LockContentionSummary, MethodProfile,
    ThreadProfile,
};
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};
use crate::trend::Trend;

const TOP_LIMIT: usize = 10;
const THREAD_METHODS_LIMIT: usize = 5;
const HOTSPOT_PCT: f64 = 20.0;
const DOMINANT_HOTSPOT_PCT: f64 = 50.0;
const HIGH_ALLOCATION_BYTES: u64 = 100 * 1024 * 1024;
const HIGH_IO_EVENTS: u64 = 100;
const HIGH_IO_MS: u64 = 1_000;
const LOCK_BLOCKED_MS: u64 = 1_000;
const HEAVY_LOCK_BLOCKED_MS: u64 = 5_000;
const BUSY_RUNNING_PCT: f64 = 10.0;
const HOT_THREAD_PCT: f64 = 5.0;
const EMERGING_FROM_PCT: f64 = 5.0;
const EMERGING_TO_PCT: f64 = 10.0;
const METHOD_SHIFT_PCT: f64 = 5.0;
const ALLOCATION_TREND_PCT: f64 = 20.0;

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum MethodTrend {
    Emerging,
    Increasing,
    Decreasing,
    Stable,
}

/// CPU share of one method across the snapshots where it ranked in the top list.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct MethodEvolution {
    pub method: String,
    pub percentages: Vec<f64>,
    pub first: f64,
    pub last: f64,
    /// `last - first`, in percentage points.
    pub change: f64,
    /// Relative change, zero when `first` is zero.
    pub change_percent: f64,
    pub emerging: bool,
    pub increasing: bool,
    pub decreasing: bool,
}

impl MethodEvolution {
    fn of(method: String, percentages: Vec<f64>) -> Option<Self> {
        if percentages.len() < 2 {
            return None;
        }
        let first = *percentages.first()?;
        let last = *percentages.last()?;
        let change = last - first;
        Some(Self {
            method,
            first,
            last,
            change,
            change_percent: if first > 0.0 { change / first * 100.0 } else { 0.0 },
            emerging: first < EMERGING_FROM_PCT && last > EMERGING_TO_PCT,
            increasing: change > METHOD_SHIFT_PCT,
            decreasing: change < -METHOD_SHIFT_PCT,
            percentages,
        })
    }

    pub fn trend(&self) -> MethodTrend {
        if self.emerging {
            MethodTrend::Emerging
        } else if self.increasing {
            MethodTrend::Increasing
        } else if self.decreasing {
            MethodTrend::Decreasing
        } else {
            MethodTrend::Stable
        }
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct TemporalProfile {
    /// Largest absolute change first.
    pub methods: Vec<MethodEvolution>,
    pub allocation_bytes_per_snapshot: Vec<u64>,
    pub io_events_per_snapshot: Vec<u64>,
    #[facet(skip_unless_truthy)]
    pub allocation_trend: Option<Trend>,
    #[facet(skip_unless_truthy)]
    pub io_trend: Option<Trend>,
}

/// A hot trace thread as it appears in the last snapshot.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ThreadCorrelation {
    pub thread_name: String,
    #[facet(skip_unless_truthy)]
    pub state: Option<ThreadState>,
    pub samples: u64,
    pub cpu_percentage: f64,
    pub top_methods: Vec<MethodProfile>,
}

#[derive(Facet, Clone, Debug, Default, PartialEq)]
pub struct ProfilingCounts {
    pub samples: usize,
    pub lock_events: usize,
    pub allocation_events: usize,
    pub io_events: usize,
    pub total_blocked_ms: u64,
}

#[derive(Facet, Clone, Debug, Default, PartialEq)]
pub struct ProfilingReport {
    #[facet(default)]
    pub hottest_methods: Vec<MethodProfile>,
    #[facet(default)]
    pub hottest_threads: Vec<ThreadProfile>,
    #[facet(default)]
    pub correlations: Vec<ThreadCorrelation>,
    #[facet(default)]
    pub allocation_hotspots: Vec<AllocationProfile>,
    #[facet(default)]
    pub io_hotspots: Vec<IoTargetProfile>,
    #[facet(skip_unless_truthy)]
    pub io: Option<IoSummary>,
    #[facet(skip_unless_truthy)]
    pub locks: Option<LockContentionSummary>,
    pub counts: ProfilingCounts,
    #[facet(skip_unless_truthy)]
    pub temporal: Option<TemporalProfile>,
}

impl ProfilingReport {
    pub fn summary(&self) -> String {
        if self.counts.samples == 0 {
            return "No trace profiling data available".to_string();
        }
        format!(
            "Trace: {} samples, {} lock events, {} I/O events",
            self.counts.samples, self.counts.lock_events, self.counts.io_events
        )
    }
}

pub struct TraceProfilingAnalyzer;

impl TraceProfilingAnalyzer {
    pub const NAME: &'static str = "trace-profiling";
}

impl Analyzer for TraceProfilingAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Correlates trace profiling data with thread dumps to identify hot methods and threads"
    }

    fn priority(&self) -> i32 {
        70
    }

    fn requires_trace(&self) -> bool {
        true
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let Some(data) = ctx.trace_for_range().filter(|d| !d.is_empty()) else {
            return Ok(AnalysisResult::from_findings(
                Self::NAME,
                Vec::new(),
                ResultPayload::TraceProfiling(ProfilingReport::default()),
            ));
        };

        let hottest_methods = profile::hottest_methods(&data, TOP_LIMIT);
        let hottest_threads = profile::hottest_threads(&data, TOP_LIMIT);
        let io = profile::io_summary(&data);
        let allocation_hotspots = profile::allocation_hotspots(&data, TOP_LIMIT);
        let locks = profile::lock_contention_summary(&data);
        let io_hotspots = profile::io_hotspots(&data, TOP_LIMIT);

        let mut findings = Vec::new();

        let temporal = ctx.is_multi().then(|| temporal_profile(ctx));
        if let Some(temporal) = &temporal {
            temporal_findings(temporal, &mut findings);
        }

        let last = ctx.filtered_threads(ctx.last());
        let correlations: Vec<ThreadCorrelation> = hottest_threads
            .iter()
            .filter_map(|hot| {
                let thread = last
                    .iter()
                    .find(|t| t.name.as_deref() == Some(hot.thread_name.as_str()))?;
                Some(ThreadCorrelation {
                    thread_name: hot.thread_name.clone(),
                    state: thread.state,
                    samples: hot.samples,
                    cpu_percentage: hot.percentage,
                    top_methods: profile::hottest_methods_for_thread(
                        &data,
                        &hot.thread_name,
                        THREAD_METHODS_LIMIT,
                    ),
                })
            })
            .collect();

        if let Some(top) = hottest_methods.first()
            && top.percentage >= HOTSPOT_PCT
        {
            let severity = if top.percentage >= DOMINANT_HOTSPOT_PCT {
                Severity::Warning
            } else {
                Severity::Info
            };
            findings.push(
                Finding::builder(
                    severity,
                    "cpu-hotspot",
                    format!(
                        "Method {} consumes {:.1}% of CPU samples",
                        shorten_method(&top.method),
                        top.percentage
                    ),
                )
                .detail("method", &top.method)
                .detail("sample_count", &top.samples)
                .detail("percentage", &top.percentage)
                .build(),
            );
        }

        if let Some(top) = allocation_hotspots.first()
            && top.total_bytes > HIGH_ALLOCATION_BYTES
        {
            findings.push(
                Finding::builder(
                    Severity::Info,
                    "high-allocation",
                    format!(
                        "High allocation at {}: {} allocated ({} objects)",
                        shorten_method(&top.site),
                        profile::format_size(top.total_bytes),
                        top.count
                    ),
                )
                .detail("site", &top.site)
                .detail("total_bytes", &top.total_bytes)
                .detail("count", &top.count)
                .build(),
            );
        }

        if io.total_events > HIGH_IO_EVENTS && io.total_duration_ms > HIGH_IO_MS {
            findings.push(
                Finding::builder(
                    Severity::Info,
                    "high-io-activity",
                    format!(
                        "High I/O activity: {} events, {} transferred, {}ms total I/O time",
                        io.total_events,
                        profile::format_size(io.total_bytes),
                        io.total_duration_ms
                    ),
                )
                .detail("event_count", &io.total_events)
                .detail("total_bytes", &io.total_bytes)
                .detail("total_duration_ms", &io.total_duration_ms)
                .build(),
            );
        }

        if locks.total_blocked_ms > LOCK_BLOCKED_MS {
            let severity = if locks.total_blocked_ms > HEAVY_LOCK_BLOCKED_MS {
                Severity::Warning
            } else {
                Severity::Info
            };
            findings.push(
                Finding::builder(
                    severity,
                    "jfr-lock-contention",
                    format!(
                        "Lock contention detected: {} events, {}ms total blocked time",
                        locks.total_events, locks.total_blocked_ms
                    ),
                )
                .detail("event_count", &locks.total_events)
                .detail("unique_locks", &locks.unique_locks)
                .detail("total_blocked_ms", &locks.total_blocked_ms)
                .build(),
            );
        }

        for correlation in &correlations {
            let Some(state) = correlation.state else {
                continue;
            };
            let busy_running =
                correlation.cpu_percentage >= BUSY_RUNNING_PCT && state == ThreadState::Runnable;
            if busy_running {
                continue;
            }
            if correlation.cpu_percentage >= HOT_THREAD_PCT
                && matches!(state, ThreadState::Blocked | ThreadState::Waiting)
            {
                findings.push(
                    Finding::builder(
                        Severity::Info,
                        "hot-thread-now-blocked",
                        format!(
                            "Thread '{}' consumed {:.1}% CPU but is now {state}",
                            correlation.thread_name, correlation.cpu_percentage
                        ),
                    )
                    .affected_thread(correlation.thread_name.clone())
                    .detail("cpu_percentage", &correlation.cpu_percentage)
                    .detail("current_state", &state.as_str().to_string())
                    .build(),
                );
            }
        }

        let counts = ProfilingCounts {
            samples: data.execution_samples.len(),
            lock_events: data.lock_events.len(),
            allocation_events: data.allocation_events.len(),
            io_events: data.io_events.len(),
            total_blocked_ms: locks.total_blocked_ms,
        };

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::TraceProfiling(ProfilingReport {
                hottest_methods,
                hottest_threads,
                correlations,
                allocation_hotspots,
                io_hotspots,
                io: Some(io),
                locks: Some(locks),
                counts,
                temporal,
            }),
        ))
    }
}

fn temporal_profile(ctx: &CorrelationContext) -> TemporalProfile {
    let mut per_method: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut first_seen: Vec<String> = Vec::new();
    let mut allocation_bytes_per_snapshot = Vec::new();
    let mut io_events_per_snapshot = Vec::new();

    for index in 0..ctx.snapshot_count() {
        let Some(data) = ctx.trace_for_snapshot(index).filter(|d| !d.is_empty()) else {
            continue;
        };
        for method in profile::hottest_methods(&data, TOP_LIMIT) {
            let series = per_method.entry(method.method.clone()).or_default();
            if series.is_empty() {
                first_seen.push(method.method);
            }
            series.push(method.percentage);
        }
        allocation_bytes_per_snapshot
            .push(data.allocation_events.iter().map(|e| e.size_bytes).sum());
        io_events_per_snapshot.push(data.io_events.len() as u64);
    }

    let mut methods: Vec<MethodEvolution> = first_seen
        .into_iter()
        .filter_map(|method| {
            let series = per_method.remove(&method)?;
            MethodEvolution::of(method, series)
        })
        .collect();
    methods.sort_by(|a, b| b.change.abs().total_cmp(&a.change.abs()));

    let trend_of = |values: &[u64]| {
        (!values.is_empty()).then(|| {
            let values: Vec<f64> = values.iter().map(|&v| v as f64).collect();
            Trend::of(&values)
        })
    };

    TemporalProfile {
        methods,
        allocation_trend: trend_of(&allocation_bytes_per_snapshot),
        io_trend: trend_of(&io_events_per_snapshot),
        allocation_bytes_per_snapshot,
        io_events_per_snapshot,
    }
}

fn temporal_findings(temporal: &TemporalProfile, findings: &mut Vec<Finding>) {
    for evolution in &temporal.methods {
        if evolution.emerging && evolution.last > EMERGING_TO_PCT {
            findings.push(
                Finding::builder(
                    Severity::Warning,
                    "emerging-hotspot",
                    format!(
                        "Method {} is emerging hotspot: {:.1}% → {:.1}% CPU",
                        shorten_method(&evolution.method),
                        evolution.first,
                        evolution.last
                    ),
                )
                .detail("method", &evolution.method)
                .detail("change_percent", &evolution.change_percent)
                .build(),
            );
        }
    }

    if let Some(trend) = &temporal.allocation_trend
        && trend.is_increasing()
    {
        let message = match trend.change_pct {
            Some(rate) if rate.abs() > ALLOCATION_TREND_PCT => {
                Some(format!("Allocation rate increased by {:.1}%", rate.abs()))
            }
            Some(_) => None,
            None => Some("Allocation started after the first snapshot".to_string()),
        };
        if let Some(message) = message {
            findings.push(
                Finding::builder(Severity::Info, "allocation-trend", message)
                    .detail("change", &trend.change_display())
                    .build(),
            );
        }
    }
}

/// `com.acme.Foo.bar` becomes `...Foo.bar`.
fn shorten_method(method: &str) -> String {
    let Some(last_dot) = method.rfind('.') else {
        return method.to_string();
    };
    match method[..last_dot].rfind('.') {
        Some(prev_dot) if prev_dot > 0 => format!("...{}", &method[prev_dot + 1..]),
        _ => method.to_string(),
    }
}
