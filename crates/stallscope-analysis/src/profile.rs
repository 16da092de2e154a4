//! Aggregations over trace events: hottest methods and threads, lock,
//! allocation, class-loading and I/O summaries.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use facet::Facet;
use stallscope_types::trace::{IoEvent, IoEventKind, TraceData};

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct MethodProfile {
    pub method: String,
    pub samples: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct ThreadProfile {
    pub thread_name: String,
    pub samples: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct LockProfile {
    pub monitor_class: String,
    pub events: u64,
    pub total_ms: u64,
    pub max_ms: u64,
    /// Distinct threads that blocked on this monitor class.
    pub waiters: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct LockContentionSummary {
    pub total_events: u64,
    pub unique_locks: u64,
    pub total_blocked_ms: u64,
    pub locks: Vec<LockProfile>,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct AllocationProfile {
    pub site: String,
    pub count: u64,
    pub total_bytes: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct ClassLoadingSummary {
    pub total_classes: u64,
    pub total_duration_ms: u64,
    pub by_loader: BTreeMap<String, u64>,
    /// Most recently loaded classes, newest first.
    pub recent_classes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct IoKindProfile {
    pub kind: IoEventKind,
    pub events: u64,
    pub bytes: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct IoSummary {
    pub total_events: u64,
    pub total_bytes: u64,
    pub total_duration_ms: u64,
    pub by_kind: Vec<IoKindProfile>,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct IoTargetProfile {
    pub target: String,
    pub events: u64,
    pub bytes: u64,
    pub percentage: f64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct ThreadIoProfile {
    pub thread_name: String,
    pub events: u64,
    pub bytes: u64,
    pub total_ms: u64,
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Count-descending, then key-ascending, so equal counts are deterministic.
fn top_counts(counts: HashMap<String, u64>, limit: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(limit);
    entries
}

// ── CPU samples ─────────────────────────────────────────────────

pub fn hottest_methods(data: &TraceData, limit: usize) -> Vec<MethodProfile> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for sample in &data.execution_samples {
        if let Some(method) = sample.top_method() {
            *counts.entry(method).or_default() += 1;
        }
    }
    let total = data.execution_samples.len() as u64;
    top_counts(counts, limit)
        .into_iter()
        .map(|(method, samples)| MethodProfile {
            method,
            samples,
            percentage: percent(samples, total),
        })
        .collect()
}

/// Like [`hottest_methods`] but relative to one thread's own samples.
pub fn hottest_methods_for_thread(
    data: &TraceData,
    thread_name: &str,
    limit: usize,
) -> Vec<MethodProfile> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    let mut total = 0u64;
    for sample in data.samples_for_thread(thread_name) {
        if let Some(method) = sample.top_method() {
            *counts.entry(method).or_default() += 1;
            total += 1;
        }
    }
    top_counts(counts, limit)
        .into_iter()
        .map(|(method, samples)| MethodProfile {
            method,
            samples,
            percentage: percent(samples, total),
        })
        .collect()
}

pub fn hottest_threads(data: &TraceData, limit: usize) -> Vec<ThreadProfile> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for sample in &data.execution_samples {
        if let Some(name) = &sample.thread_name {
            *counts.entry(name.clone()).or_default() += 1;
        }
    }
    let total = data.execution_samples.len() as u64;
    top_counts(counts, limit)
        .into_iter()
        .map(|(thread_name, samples)| ThreadProfile {
            thread_name,
            samples,
            percentage: percent(samples, total),
        })
        .collect()
}

// ── Locks ───────────────────────────────────────────────────────

pub fn lock_contention_summary(data: &TraceData) -> LockContentionSummary {
    #[derive(Default)]
    struct Stats {
        events: u64,
        total_ms: u64,
        max_ms: u64,
        threads: BTreeSet<String>,
    }

    let mut by_class: BTreeMap<String, Stats> = BTreeMap::new();
    for event in &data.lock_events {
        let class = event.monitor_class.as_deref().unwrap_or("unknown");
        let stats = by_class.entry(class.to_string()).or_default();
        stats.events += 1;
        stats.total_ms += event.duration_ms;
        stats.max_ms = stats.max_ms.max(event.duration_ms);
        if let Some(thread) = &event.thread_name {
            stats.threads.insert(thread.clone());
        }
    }

    let total_blocked_ms = by_class.values().map(|s| s.total_ms).sum();
    let mut locks: Vec<LockProfile> = by_class
        .into_iter()
        .map(|(monitor_class, s)| LockProfile {
            monitor_class,
            events: s.events,
            total_ms: s.total_ms,
            max_ms: s.max_ms,
            waiters: s.threads.len() as u64,
        })
        .collect();
    locks.sort_by(|a, b| b.total_ms.cmp(&a.total_ms));

    LockContentionSummary {
        total_events: data.lock_events.len() as u64,
        unique_locks: locks.len() as u64,
        total_blocked_ms,
        locks,
    }
}

// ── Allocations ─────────────────────────────────────────────────

pub fn allocation_hotspots(data: &TraceData, limit: usize) -> Vec<AllocationProfile> {
    let mut by_site: HashMap<String, (u64, u64)> = HashMap::new();
    for event in &data.allocation_events {
        let site = event
            .allocation_site()
            .unwrap_or_else(|| "unknown".to_string());
        let entry = by_site.entry(site).or_default();
        entry.0 += 1;
        entry.1 += event.size_bytes;
    }
    let total: u64 = by_site.values().map(|(_, bytes)| bytes).sum();
    let mut sites: Vec<AllocationProfile> = by_site
        .into_iter()
        .map(|(site, (count, total_bytes))| AllocationProfile {
            site,
            count,
            total_bytes,
            percentage: percent(total_bytes, total),
        })
        .collect();
    sites.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes).then_with(|| a.site.cmp(&b.site)));
    sites.truncate(limit);
    sites
}

// ── Class loading ───────────────────────────────────────────────

pub fn class_loading_summary(data: &TraceData) -> ClassLoadingSummary {
    let mut by_loader: BTreeMap<String, u64> = BTreeMap::new();
    let mut total_duration_ms = 0;
    for event in &data.class_load_events {
        *by_loader
            .entry(event.loader_or_bootstrap().to_string())
            .or_default() += 1;
        total_duration_ms += event.duration_ms;
    }

    let mut newest_first: Vec<_> = data.class_load_events.iter().collect();
    newest_first.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
    let recent_classes = newest_first
        .into_iter()
        .filter_map(|e| e.loaded_class.clone())
        .take(20)
        .collect();

    ClassLoadingSummary {
        total_classes: data.class_load_events.len() as u64,
        total_duration_ms,
        by_loader,
        recent_classes,
    }
}

// ── I/O ─────────────────────────────────────────────────────────

#[derive(Default)]
struct IoStats {
    events: u64,
    bytes: u64,
    total_ms: u64,
    max_ms: u64,
}

impl IoStats {
    fn add(&mut self, event: &IoEvent) {
        self.events += 1;
        self.bytes += event.bytes;
        self.total_ms += event.duration_ms;
        self.max_ms = self.max_ms.max(event.duration_ms);
    }
}

pub fn io_summary(data: &TraceData) -> IoSummary {
    let mut by_kind: BTreeMap<IoEventKind, IoStats> = BTreeMap::new();
    for event in &data.io_events {
        by_kind.entry(event.kind).or_default().add(event);
    }
    let mut profiles: Vec<IoKindProfile> = by_kind
        .into_iter()
        .map(|(kind, s)| IoKindProfile {
            kind,
            events: s.events,
            bytes: s.bytes,
            total_ms: s.total_ms,
            max_ms: s.max_ms,
        })
        .collect();
    profiles.sort_by(|a, b| b.bytes.cmp(&a.bytes));

    IoSummary {
        total_events: data.io_events.len() as u64,
        total_bytes: profiles.iter().map(|p| p.bytes).sum(),
        total_duration_ms: profiles.iter().map(|p| p.total_ms).sum(),
        by_kind: profiles,
    }
}

/// I/O targets ranked by total time spent.
pub fn io_hotspots(data: &TraceData, limit: usize) -> Vec<IoTargetProfile> {
    let mut by_target: HashMap<String, IoStats> = HashMap::new();
    for event in &data.io_events {
        by_target.entry(event.target()).or_default().add(event);
    }
    let total_bytes: u64 = by_target.values().map(|s| s.bytes).sum();
    let mut targets: Vec<IoTargetProfile> = by_target
        .into_iter()
        .map(|(target, s)| IoTargetProfile {
            target,
            events: s.events,
            bytes: s.bytes,
            percentage: percent(s.bytes, total_bytes),
            total_ms: s.total_ms,
        })
        .collect();
    targets.sort_by(|a, b| b.total_ms.cmp(&a.total_ms).then_with(|| a.target.cmp(&b.target)));
    targets.truncate(limit);
    targets
}

pub fn io_by_thread(data: &TraceData, limit: usize) -> Vec<ThreadIoProfile> {
    let mut by_thread: HashMap<String, IoStats> = HashMap::new();
    for event in &data.io_events {
        if let Some(name) = &event.thread_name {
            by_thread.entry(name.clone()).or_default().add(event);
        }
    }
    let mut threads: Vec<ThreadIoProfile> = by_thread
        .into_iter()
        .map(|(thread_name, s)| ThreadIoProfile {
            thread_name,
            events: s.events,
            bytes: s.bytes,
            total_ms: s.total_ms,
        })
        .collect();
    threads.sort_by(|a, b| {
        b.total_ms
            .cmp(&a.total_ms)
            .then_with(|| a.thread_name.cmp(&b.thread_name))
    });
    threads.truncate(limit);
    threads
}

/// I/O events slower than `threshold_ms`, slowest first.
pub fn slow_io_operations(data: &TraceData, threshold_ms: u64) -> Vec<&IoEvent> {
    let mut slow: Vec<&IoEvent> = data
        .io_events
        .iter()
        .filter(|e| e.duration_ms > threshold_ms)
        .collect();
    slow.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
    slow
}

/// Human-readable byte count, e.g. `1.5 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use stallscope_types::trace::{LockEvent, LockEventKind, MethodSample, TraceFrame};

    fn sample(thread: &str, class: &str, method: &str) -> MethodSample {
        MethodSample {
            timestamp_ms: 0,
            thread_name: Some(thread.to_string()),
            thread_id: None,
            thread_state: None,
            frames: vec![TraceFrame::new(class, method)],
        }
    }

    fn io(target: &str, duration_ms: u64, bytes: u64) -> IoEvent {
        IoEvent {
            timestamp_ms: 0,
            thread_name: Some("io-1".to_string()),
            kind: IoEventKind::FileRead,
            path: Some(target.to_string()),
            host: None,
            port: None,
            bytes,
            duration_ms,
            frames: Vec::new(),
        }
    }

    #[test]
    fn hottest_methods_rank_by_samples() {
        let data = TraceData {
            execution_samples: vec![
                sample("a", "X", "hot"),
                sample("b", "X", "hot"),
                sample("a", "X", "hot"),
                sample("a", "Y", "cold"),
            ],
            ..TraceData::default()
        };
        let methods = hottest_methods(&data, 10);
        assert_eq!(methods[0].method, "X.hot");
        assert_eq!(methods[0].samples, 3);
        assert_eq!(methods[0].percentage, 75.0);

        let threads = hottest_threads(&data, 1);
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].thread_name, "a");

        let for_b = hottest_methods_for_thread(&data, "b", 5);
        assert_eq!(for_b[0].percentage, 100.0);
    }

    #[test]
    fn lock_summary_totals() {
        let ev = |class: &str, ms: u64, thread: &str| LockEvent {
            timestamp_ms: 0,
            thread_name: Some(thread.to_string()),
            monitor_class: Some(class.to_string()),
            duration_ms: ms,
            previous_owner: None,
            kind: LockEventKind::Enter,
        };
        let data = TraceData {
            lock_events: vec![ev("Cache", 300, "a"), ev("Cache", 700, "b"), ev("Pool", 10, "a")],
            ..TraceData::default()
        };
        let summary = lock_contention_summary(&data);
        assert_eq!(summary.total_events, 3);
        assert_eq!(summary.unique_locks, 2);
        assert_eq!(summary.total_blocked_ms, 1010);
        assert_eq!(summary.locks[0].monitor_class, "Cache");
        assert_eq!(summary.locks[0].max_ms, 700);
        assert_eq!(summary.locks[0].waiters, 2);
    }

    #[test]
    fn io_rankings() {
        let data = TraceData {
            io_events: vec![io("/a", 50, 10), io("/b", 500, 30), io("/a", 60, 0)],
            ..TraceData::default()
        };
        let summary = io_summary(&data);
        assert_eq!(summary.total_events, 3);
        assert_eq!(summary.total_bytes, 40);
        assert_eq!(summary.total_duration_ms, 610);

        let hotspots = io_hotspots(&data, 10);
        assert_eq!(hotspots[0].target, "/b");
        assert_eq!(hotspots[1].events, 2);

        let slow = slow_io_operations(&data, 55);
        assert_eq!(slow.len(), 2);
        assert_eq!(slow[0].duration_ms, 500);
    }

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
