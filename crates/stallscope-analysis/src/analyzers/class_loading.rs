//! Class-loading volume, latency and loader skew, from trace events.

use facet::Facet;
use stallscope_types::trace::ClassLoadEvent;

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::context::CorrelationContext;
use crate::profile::{self, ClassLoadingSummary};
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};
use crate::trend::Trend;

const EXCESSIVE_CLASSES: u64 = 100;
const VERY_EXCESSIVE_CLASSES: u64 = 500;
const SLOW_TOTAL_MS: u64 = 500;
const VERY_SLOW_TOTAL_MS: u64 = 2_000;
const SLOW_LOAD_MS: u64 = 50;
const SLOWEST_REPORT_MS: u64 = 100;
const SLOW_LOADS_KEPT: usize = 10;
const DOMINANT_FRACTION: f64 = 0.8;
const RATE_INCREASE_PCT: f64 = 50.0;
const WARMUP_MIN_CLASSES: usize = 100;
const WARMUP_REMAINING_FRACTION: f64 = 0.3;

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct LoadingTemporal {
    pub classes_per_snapshot: Vec<usize>,
    pub duration_ms_per_snapshot: Vec<u64>,
    pub loading_trend: Trend,
    pub duration_trend: Trend,
    /// Heavy loading early on that drops by more than 70 % by the last snapshot.
    pub warmup: bool,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ClassLoadingReport {
    pub totals: ClassLoadingSummary,
    /// Loads slower than 50 ms, slowest first, at most ten.
    #[facet(default)]
    pub slow_loads: Vec<ClassLoadEvent>,
    pub excessive: bool,
    pub slow: bool,
    #[facet(skip_unless_truthy)]
    pub temporal: Option<LoadingTemporal>,
}

impl ClassLoadingReport {
    fn empty() -> Self {
        Self {
            totals: ClassLoadingSummary::default(),
            slow_loads: Vec::new(),
            excessive: false,
            slow: false,
            temporal: None,
        }
    }

    pub fn loader_count(&self) -> usize {
        self.totals.by_loader.len()
    }

    pub fn summary(&self) -> String {
        if self.totals.total_classes == 0 {
            return "No class loading events".to_string();
        }
        let mut out = format!(
            "{} classes loaded in {}ms",
            self.totals.total_classes, self.totals.total_duration_ms
        );
        if self.excessive {
            out.push_str(" [excessive]");
        }
        if self.slow {
            out.push_str(" [slow]");
        }
        out
    }
}

pub struct ClassLoadingAnalyzer;

impl ClassLoadingAnalyzer {
    pub const NAME: &'static str = "class-loading";
}

impl Analyzer for ClassLoadingAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Detects excessive class loading activity (requires trace data)"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn requires_trace(&self) -> bool {
        true
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let Some(data) = ctx
            .trace_for_range()
            .filter(|d| !d.class_load_events.is_empty())
        else {
            return Ok(AnalysisResult::from_findings(
                Self::NAME,
                Vec::new(),
                ResultPayload::ClassLoading(ClassLoadingReport::empty()),
            ));
        };

        let mut findings = Vec::new();

        let temporal = ctx.is_multi().then(|| loading_rate(ctx));
        if let Some(t) = &temporal
            && t.loading_trend.is_increasing()
        {
            let message = match t.loading_trend.change_pct {
                Some(pct) if pct.abs() > RATE_INCREASE_PCT => {
                    Some(format!("Class loading rate increased by {:.1}%", pct.abs()))
                }
                Some(_) => None,
                None => Some("Class loading started after the first snapshot".to_string()),
            };
            if let Some(message) = message {
                findings.push(
                    Finding::builder(Severity::Warning, "increasing-class-loading", message)
                        .detail("change_rate", &t.loading_trend.change_pct)
                        .build(),
                );
            }
        }

        let totals = profile::class_loading_summary(&data);
        let mut slow_loads: Vec<ClassLoadEvent> = data
            .class_load_events
            .iter()
            .filter(|e| e.duration_ms > SLOW_LOAD_MS)
            .cloned()
            .collect();
        slow_loads.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
        slow_loads.truncate(SLOW_LOADS_KEPT);

        let excessive = totals.total_classes > EXCESSIVE_CLASSES;
        if excessive {
            let severity = if totals.total_classes > VERY_EXCESSIVE_CLASSES {
                Severity::Warning
            } else {
                Severity::Info
            };
            findings.push(
                Finding::builder(
                    severity,
                    "excessive-class-loading",
                    format!(
                        "Excessive class loading: {} classes loaded",
                        totals.total_classes
                    ),
                )
                .detail("total_classes", &totals.total_classes)
                .detail("total_duration_ms", &totals.total_duration_ms)
                .build(),
            );
        }

        let slow = totals.total_duration_ms > SLOW_TOTAL_MS;
        if slow {
            let severity = if totals.total_duration_ms > VERY_SLOW_TOTAL_MS {
                Severity::Warning
            } else {
                Severity::Info
            };
            findings.push(
                Finding::builder(
                    severity,
                    "slow-class-loading",
                    format!(
                        "Slow class loading: {}ms total for {} classes",
                        totals.total_duration_ms, totals.total_classes
                    ),
                )
                .detail("total_duration_ms", &totals.total_duration_ms)
                .detail("total_classes", &totals.total_classes)
                .build(),
            );
        }

        if let Some(slowest) = slow_loads.first()
            && slowest.duration_ms > SLOWEST_REPORT_MS
        {
            let class = slowest.loaded_class.as_deref().unwrap_or("<unknown>");
            findings.push(
                Finding::builder(
                    Severity::Info,
                    "slow-class-load",
                    format!("Slowest class load: {class} took {}ms", slowest.duration_ms),
                )
                .detail("class_name", &class.to_string())
                .detail("duration_ms", &slowest.duration_ms)
                .detail("class_loader", &slowest.loader_or_bootstrap().to_string())
                .build(),
            );
        }

        if totals.by_loader.len() > 1
            && let Some((loader, count)) = dominant_loader(&totals)
        {
            findings.push(
                Finding::builder(
                    Severity::Info,
                    "dominant-classloader",
                    format!(
                        "Class loader '{loader}' loaded {count}/{} classes ({:.0}%)",
                        totals.total_classes,
                        count as f64 * 100.0 / totals.total_classes as f64
                    ),
                )
                .detail("class_loader", &loader.to_string())
                .detail("count", &count)
                .build(),
            );
        }

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::ClassLoading(ClassLoadingReport {
                totals,
                slow_loads,
                excessive,
                slow,
                temporal,
            }),
        ))
    }
}

/// The loader responsible for more than 80 % of all loads, if any.
fn dominant_loader(totals: &ClassLoadingSummary) -> Option<(&str, u64)> {
    let (loader, &count) = totals
        .by_loader
        .iter()
        .fold(None, |best: Option<(&String, &u64)>, entry| match best {
            Some((_, n)) if n >= entry.1 => best,
            _ => Some(entry),
        })?;
    (count as f64 > totals.total_classes as f64 * DOMINANT_FRACTION)
        .then_some((loader.as_str(), count))
}

fn loading_rate(ctx: &CorrelationContext) -> LoadingTemporal {
    let (classes, durations): (Vec<usize>, Vec<u64>) = (0..ctx.snapshot_count())
        .map(|i| {
            ctx.trace_for_snapshot(i).map_or((0, 0), |d| {
                (
                    d.class_load_events.len(),
                    d.class_load_events.iter().map(|e| e.duration_ms).sum(),
                )
            })
        })
        .unzip();

    let warmup = match (classes.first(), classes.last()) {
        (Some(&first), Some(&last)) if classes.len() >= 3 => {
            first > WARMUP_MIN_CLASSES && (last as f64) < first as f64 * WARMUP_REMAINING_FRACTION
        }
        _ => false,
    };

    LoadingTemporal {
        loading_trend: Trend::of(&classes.iter().map(|&n| n as f64).collect::<Vec<_>>()),
        duration_trend: Trend::of(&durations.iter().map(|&n| n as f64).collect::<Vec<_>>()),
        classes_per_snapshot: classes,
        duration_ms_per_snapshot: durations,
        warmup,
    }
}

#[cfg(test)]
mod tests {
    use stallscope_types::trace::TraceData;

    use super::*;
    use crate::analyzers::test_support::*;

    fn load(ts: i64, class: &str, loader: Option<&str>, duration_ms: u64) -> ClassLoadEvent {
        ClassLoadEvent {
            timestamp_ms: ts,
            loaded_class: Some(class.to_string()),
            thread_name: Some("main".to_string()),
            class_loader: loader.map(str::to_string),
            duration_ms,
        }
    }

    fn report(result: &AnalysisResult) -> &ClassLoadingReport {
        match &result.payload {
            ResultPayload::ClassLoading(r) => r,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn needs_a_trace() {
        let c = ctx(vec![snapshot(0, Vec::new())]);
        assert!(!ClassLoadingAnalyzer.can_analyze(&c));
    }

    #[test]
    fn heavy_slow_loading() {
        let mut events: Vec<ClassLoadEvent> = (0..150)
            .map(|i| load(i, &format!("com.acme.C{i}"), Some("app"), 2))
            .collect();
        events.push(load(200, "com.acme.Huge", Some("app"), 400));
        let data = TraceData {
            class_load_events: events,
            ..TraceData::default()
        };
        let c = ctx_with_trace(vec![snapshot(0, Vec::new())], data);
        let result = ClassLoadingAnalyzer.analyze(&c).unwrap();
        let categories: Vec<&str> = result.findings.iter().map(|f| f.category.as_str()).collect();
        assert_eq!(
            categories,
            vec!["excessive-class-loading", "slow-class-loading", "slow-class-load"]
        );
        assert_eq!(
            result.findings[2].message,
            "Slowest class load: com.acme.Huge took 400ms"
        );
        assert_eq!(result.severity, Severity::Info);
        assert_eq!(
            result.summary(),
            "151 classes loaded in 700ms [excessive] [slow]"
        );
        assert_eq!(report(&result).slow_loads.len(), 1);
    }

    #[test]
    fn skewed_loader_distribution() {
        let mut events: Vec<ClassLoadEvent> = (0..9)
            .map(|i| load(i, &format!("C{i}"), Some("plugin"), 1))
            .collect();
        events.push(load(20, "java.lang.String", None, 1));
        let data = TraceData {
            class_load_events: events,
            ..TraceData::default()
        };
        let c = ctx_with_trace(vec![snapshot(0, Vec::new())], data);
        let result = ClassLoadingAnalyzer.analyze(&c).unwrap();
        assert_eq!(
            result.findings[0].message,
            "Class loader 'plugin' loaded 9/10 classes (90%)"
        );
        assert_eq!(report(&result).loader_count(), 2);
    }

    #[test]
    fn rising_rate_across_snapshots() {
        let mut events = vec![load(0, "A", None, 1)];
        events.extend((0..4).map(|i| load(10_000 + i, &format!("B{i}"), None, 1)));
        let data = TraceData {
            class_load_events: events,
            ..TraceData::default()
        };
        let c = ctx_with_trace(
            vec![snapshot(0, Vec::new()), snapshot(10_000, Vec::new())],
            data,
        );
        let result = ClassLoadingAnalyzer.analyze(&c).unwrap();
        let temporal = report(&result).temporal.as_ref().unwrap();
        assert_eq!(temporal.classes_per_snapshot, vec![1, 4]);
        assert!(!temporal.warmup);
        assert_eq!(
            result.findings[0].message,
            "Class loading rate increased by 300.0%"
        );
        assert_eq!(result.severity, Severity::Warning);
    }

    #[test]
    fn no_events_is_empty() {
        let c = ctx_with_trace(vec![snapshot(0, Vec::new())], TraceData::default());
        let result = ClassLoadingAnalyzer.analyze(&c).unwrap();
        assert_eq!(result.summary(), "No class loading events");
        assert!(result.findings.is_empty());
    }
}
