//! Threads sitting in socket, file, selector, process, database or HTTP calls.

use std::collections::BTreeMap;
use std::fmt;

use facet::Facet;
use stallscope_types::trace::IoEvent;
use stallscope_types::{StackFrame, ThreadRecord, ThreadState};

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::context::CorrelationContext;
use crate::profile::{self, IoSummary, IoTargetProfile, ThreadIoProfile};
use crate::result::{AnalysisResult, Finding, ResultPayload, Severity};

const STUCK_FRACTION: f64 = 0.8;
const SLOW_IO_MS: u64 = 100;
const HIGH_IO_TIME_MS: u64 = 5_000;
const HOTSPOT_MS: u64 = 1_000;
const TRACE_TOP: usize = 10;

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum BlockingIo {
    SocketRead,
    SocketWrite,
    SocketConnect,
    SocketAccept,
    FileRead,
    FileWrite,
    Selector,
    ProcessWait,
    ProcessRead,
    Database,
    Http,
}

impl BlockingIo {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SocketRead => "socket_read",
            Self::SocketWrite => "socket_write",
            Self::SocketConnect => "socket_connect",
            Self::SocketAccept => "socket_accept",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::Selector => "selector",
            Self::ProcessWait => "process_wait",
            Self::ProcessRead => "process_read",
            Self::Database => "database",
            Self::Http => "http",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::SocketRead => "Socket Read",
            Self::SocketWrite => "Socket Write",
            Self::SocketConnect => "Socket Connect",
            Self::SocketAccept => "Socket Accept",
            Self::FileRead => "File Read",
            Self::FileWrite => "File Write",
            Self::Selector => "NIO Selector",
            Self::ProcessWait => "Process Wait",
            Self::ProcessRead => "Process Read",
            Self::Database => "Database",
            Self::Http => "HTTP",
        }
    }
}

impl fmt::Display for BlockingIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Substrings of `class.method` that mark a blocking I/O frame.
const IO_PATTERNS: &[(&str, BlockingIo)] = &[
    ("java.net.SocketInputStream.read", BlockingIo::SocketRead),
    ("java.net.SocketInputStream.socketRead", BlockingIo::SocketRead),
    ("java.net.SocketOutputStream.write", BlockingIo::SocketWrite),
    ("java.net.Socket.connect", BlockingIo::SocketConnect),
    ("java.net.PlainSocketImpl.accept", BlockingIo::SocketAccept),
    ("java.net.ServerSocket.accept", BlockingIo::SocketAccept),
    ("sun.nio.ch.SocketChannelImpl.read", BlockingIo::SocketRead),
    ("sun.nio.ch.SocketChannelImpl.write", BlockingIo::SocketWrite),
    ("sun.nio.ch.ServerSocketChannelImpl.accept", BlockingIo::SocketAccept),
    ("java.io.FileInputStream.read", BlockingIo::FileRead),
    ("java.io.FileOutputStream.write", BlockingIo::FileWrite),
    ("java.io.RandomAccessFile.read", BlockingIo::FileRead),
    ("java.io.RandomAccessFile.write", BlockingIo::FileWrite),
    ("sun.nio.ch.FileChannelImpl.read", BlockingIo::FileRead),
    ("sun.nio.ch.FileChannelImpl.write", BlockingIo::FileWrite),
    ("sun.nio.ch.EPollSelectorImpl.doSelect", BlockingIo::Selector),
    ("sun.nio.ch.KQueueSelectorImpl.doSelect", BlockingIo::Selector),
    ("sun.nio.ch.WindowsSelectorImpl.doSelect", BlockingIo::Selector),
    ("java.nio.channels.Selector.select", BlockingIo::Selector),
    ("java.lang.ProcessImpl.waitFor", BlockingIo::ProcessWait),
    ("java.lang.Process$PipeInputStream.read", BlockingIo::ProcessRead),
    ("com.mysql.cj.protocol", BlockingIo::Database),
    ("oracle.jdbc.driver", BlockingIo::Database),
    ("org.postgresql.core", BlockingIo::Database),
    ("com.microsoft.sqlserver.jdbc", BlockingIo::Database),
    ("java.net.http.HttpClient", BlockingIo::Http),
    ("org.apache.http", BlockingIo::Http),
    ("okhttp3", BlockingIo::Http),
];

/// Kind of blocking I/O a single frame performs, if any.
pub fn classify_frame(frame: &StackFrame) -> Option<BlockingIo> {
    let method = frame.qualified_method();
    IO_PATTERNS
        .iter()
        .find(|(pattern, _)| method.contains(pattern))
        .map(|&(_, kind)| kind)
}

/// The innermost I/O frame of a stack and what it does.
pub fn classify_stack(stack: &[StackFrame]) -> Option<(BlockingIo, &StackFrame)> {
    stack
        .iter()
        .find_map(|frame| classify_frame(frame).map(|kind| (kind, frame)))
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct IoBlockedThread {
    pub thread_name: String,
    #[facet(skip_unless_truthy)]
    pub state: Option<ThreadState>,
    pub kind: BlockingIo,
    pub blocking_frame: String,
    pub snapshot_index: usize,
    pub timestamp_ms: i64,
}

#[derive(Facet, Clone, Debug, Default, PartialEq)]
pub struct IoBlockStats {
    pub total_blocked: usize,
    /// Keyed by [`BlockingIo::as_str`].
    pub counts_by_kind: BTreeMap<String, usize>,
    #[facet(skip_unless_truthy)]
    pub most_common: Option<BlockingIo>,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct TraceIo {
    pub summary: IoSummary,
    pub hotspots: Vec<IoTargetProfile>,
    pub threads: Vec<ThreadIoProfile>,
    /// Slowest first.
    pub slow_operations: Vec<IoEvent>,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct IoBlockReport {
    pub blocked: Vec<IoBlockedThread>,
    pub stats: IoBlockStats,
    #[facet(skip_unless_truthy)]
    pub trace: Option<TraceIo>,
}

impl IoBlockReport {
    pub fn of_kind(&self, kind: BlockingIo) -> impl Iterator<Item = &IoBlockedThread> {
        self.blocked.iter().filter(move |b| b.kind == kind)
    }

    pub fn summary(&self) -> String {
        let mut out = if self.stats.total_blocked == 0 {
            "No I/O blocked threads in dumps".to_string()
        } else {
            format!(
                "{} threads blocked on I/O (mostly {})",
                self.stats.total_blocked,
                self.stats
                    .most_common
                    .map_or("various", BlockingIo::display_name)
            )
        };
        if let Some(trace) = &self.trace {
            out.push_str(&format!(
                "; trace: {} I/O events, {}",
                trace.summary.total_events,
                profile::format_size(trace.summary.total_bytes)
            ));
        }
        out
    }
}

pub struct IoBlockAnalyzer;

impl IoBlockAnalyzer {
    pub const NAME: &'static str = "io-block";
}

impl Analyzer for IoBlockAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Detects threads blocked on I/O operations (socket, file, database)"
    }

    fn priority(&self) -> i32 {
        55
    }

    fn analyze(&self, ctx: &CorrelationContext) -> Result<AnalysisResult, AnalyzerError> {
        let mut blocked: Vec<IoBlockedThread> = Vec::new();
        for (index, snapshot) in ctx.snapshots().iter().enumerate() {
            blocked.extend(
                ctx.filtered_threads(snapshot)
                    .into_iter()
                    .filter_map(|t| blocked_thread(t, index, snapshot.timestamp_ms)),
            );
        }

        let mut by_kind: BTreeMap<BlockingIo, Vec<&IoBlockedThread>> = BTreeMap::new();
        for b in &blocked {
            by_kind.entry(b.kind).or_default().push(b);
        }

        let mut findings = Vec::new();
        for (kind, threads) in &by_kind {
            let severity = match threads.len() {
                10.. => Severity::Warning,
                5.. => Severity::Info,
                _ => continue,
            };
            findings.push(
                Finding::builder(
                    severity,
                    "io-blocked",
                    format!("{} threads blocked on {kind}", threads.len()),
                )
                .affected_threads(threads.iter().map(|b| b.thread_name.clone()))
                .detail("io_type", kind)
                .detail("count", &threads.len())
                .build(),
            );
        }

        if ctx.is_multi() {
            findings.extend(stuck_findings(&blocked, ctx.snapshot_count()));
        }

        let stats = IoBlockStats {
            total_blocked: blocked.len(),
            counts_by_kind: by_kind
                .iter()
                .map(|(kind, threads)| (kind.as_str().to_string(), threads.len()))
                .collect(),
            most_common: by_kind
                .iter()
                .fold(None, |best: Option<(BlockingIo, usize)>, (&kind, threads)| {
                    match best {
                        Some((_, n)) if n >= threads.len() => best,
                        _ => Some((kind, threads.len())),
                    }
                })
                .map(|(kind, _)| kind),
        };

        let trace = ctx
            .trace_for_range()
            .filter(|data| !data.io_events.is_empty())
            .map(|data| TraceIo {
                summary: profile::io_summary(&data),
                hotspots: profile::io_hotspots(&data, TRACE_TOP),
                threads: profile::io_by_thread(&data, TRACE_TOP),
                slow_operations: profile::slow_io_operations(&data, SLOW_IO_MS)
                    .into_iter()
                    .cloned()
                    .collect(),
            });
        if let Some(trace) = &trace {
            findings.extend(trace_findings(trace));
        }

        Ok(AnalysisResult::from_findings(
            Self::NAME,
            findings,
            ResultPayload::IoBlock(IoBlockReport {
                blocked,
                stats,
                trace,
            }),
        ))
    }
}

fn blocked_thread(
    thread: &ThreadRecord,
    snapshot_index: usize,
    timestamp_ms: i64,
) -> Option<IoBlockedThread> {
    let (kind, frame) = classify_stack(&thread.stack)?;
    Some(IoBlockedThread {
        thread_name: thread.name_or_empty().to_string(),
        state: thread.state,
        kind,
        blocking_frame: frame.qualified_method(),
        snapshot_index,
        timestamp_ms,
    })
}

/// Named threads found in I/O in at least 80 % of the snapshots.
fn stuck_findings(blocked: &[IoBlockedThread], snapshot_count: usize) -> Vec<Finding> {
    let mut by_name: Vec<(&str, Vec<&IoBlockedThread>)> = Vec::new();
    for b in blocked.iter().filter(|b| !b.thread_name.is_empty()) {
        match by_name.iter_mut().find(|(name, _)| *name == b.thread_name) {
            Some((_, seen)) => seen.push(b),
            None => by_name.push((b.thread_name.as_str(), vec![b])),
        }
    }

    by_name
        .into_iter()
        .filter(|(_, seen)| seen.len() as f64 >= snapshot_count as f64 * STUCK_FRACTION)
        .map(|(name, seen)| {
            let kind = seen[0].kind;
            Finding::builder(
                Severity::Warning,
                "io-stuck",
                format!("Thread '{name}' stuck in {kind} across {} dumps", seen.len()),
            )
            .affected_thread(name)
            .detail("io_type", &kind)
            .detail("dump_count", &seen.len())
            .build()
        })
        .collect()
}

fn trace_findings(trace: &TraceIo) -> Vec<Finding> {
    let mut findings = Vec::new();
    if let Some(slowest) = trace.slow_operations.first() {
        findings.push(
            Finding::builder(
                Severity::Info,
                "jfr-slow-io",
                format!(
                    "{} slow I/O operations detected (slowest: {}ms on {})",
                    trace.slow_operations.len(),
                    slowest.duration_ms,
                    slowest.target()
                ),
            )
            .detail("slow_op_count", &trace.slow_operations.len())
            .detail("slowest_duration_ms", &slowest.duration_ms)
            .detail("slowest_target", &slowest.target())
            .build(),
        );
    }
    if trace.summary.total_duration_ms > HIGH_IO_TIME_MS {
        findings.push(
            Finding::builder(
                Severity::Warning,
                "jfr-high-io-time",
                format!(
                    "High total I/O time: {}ms across {} events",
                    trace.summary.total_duration_ms, trace.summary.total_events
                ),
            )
            .detail("total_duration_ms", &trace.summary.total_duration_ms)
            .detail("total_events", &trace.summary.total_events)
            .detail("total_bytes", &trace.summary.total_bytes)
            .build(),
        );
    }
    if let Some(hottest) = trace.hotspots.first()
        && hottest.total_ms > HOTSPOT_MS
    {
        findings.push(
            Finding::builder(
                Severity::Info,
                "jfr-io-hotspot",
                format!(
                    "I/O hotspot: {} ({}ms, {})",
                    hottest.target,
                    hottest.total_ms,
                    profile::format_size(hottest.bytes)
                ),
            )
            .detail("target", &hottest.target)
            .detail("duration_ms", &hottest.total_ms)
            .detail("bytes", &hottest.bytes)
            .build(),
        );
    }
    findings
}

#[cfg(test)]
mod tests {
    use stallscope_types::trace::{IoEventKind, TraceData};

    use super::*;
    use crate::analyzers::test_support::*;

    const SOCKET_READ: &[(&str, &str)] = &[
        ("java.net.SocketInputStream", "socketRead0"),
        ("java.net.SocketInputStream", "read"),
        ("com.acme.Client", "fetch"),
    ];

    fn readers(count: usize) -> Vec<ThreadRecord> {
        (0..count)
            .map(|i| with_stack(thread(&format!("reader-{i}"), ThreadState::Runnable), SOCKET_READ))
            .collect()
    }

    fn report(result: &AnalysisResult) -> &IoBlockReport {
        match &result.payload {
            ResultPayload::IoBlock(r) => r,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn frames_classify_by_pattern() {
        let frame = StackFrame::new("sun.nio.ch.EPollSelectorImpl", "doSelect");
        assert_eq!(classify_frame(&frame), Some(BlockingIo::Selector));
        let frame = StackFrame::new("org.postgresql.core.v3.QueryExecutorImpl", "execute");
        assert_eq!(classify_frame(&frame), Some(BlockingIo::Database));
        assert_eq!(classify_frame(&StackFrame::new("com.acme.Client", "fetch")), None);

        let stack = stack(SOCKET_READ);
        let (kind, frame) = classify_stack(&stack).unwrap();
        assert_eq!(kind, BlockingIo::SocketRead);
        assert_eq!(frame.method_name, "socketRead0");
    }

    #[test]
    fn five_readers_are_info() {
        let c = ctx(vec![snapshot(0, readers(5))]);
        let result = IoBlockAnalyzer.analyze(&c).unwrap();
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].message, "5 threads blocked on Socket Read");
        assert_eq!(result.severity, Severity::Info);
        assert_eq!(
            result.summary(),
            "5 threads blocked on I/O (mostly Socket Read)"
        );
        let r = report(&result);
        assert_eq!(r.stats.counts_by_kind.get("socket_read"), Some(&5));
        assert_eq!(r.of_kind(BlockingIo::SocketRead).count(), 5);
    }

    #[test]
    fn few_readers_produce_no_findings() {
        let c = ctx(vec![snapshot(0, readers(4))]);
        let result = IoBlockAnalyzer.analyze(&c).unwrap();
        assert!(result.findings.is_empty());
    }

    #[test]
    fn thread_in_io_across_dumps_is_stuck() {
        let c = ctx(vec![
            snapshot(0, readers(1)),
            snapshot(1_000, readers(1)),
            snapshot(2_000, readers(1)),
        ]);
        let result = IoBlockAnalyzer.analyze(&c).unwrap();
        let stuck: Vec<_> = result
            .findings
            .iter()
            .filter(|f| f.category == "io-stuck")
            .collect();
        assert_eq!(stuck.len(), 1);
        assert_eq!(
            stuck[0].message,
            "Thread 'reader-0' stuck in Socket Read across 3 dumps"
        );
        assert_eq!(result.severity, Severity::Warning);
    }

    #[test]
    fn trace_io_events_add_findings() {
        let event = |ts: i64, duration_ms: u64| IoEvent {
            timestamp_ms: ts,
            thread_name: Some("reader-0".to_string()),
            kind: IoEventKind::SocketRead,
            path: None,
            host: Some("db.internal".to_string()),
            port: Some(5432),
            bytes: 2048,
            duration_ms,
            frames: Vec::new(),
        };
        let data = TraceData {
            io_events: vec![event(10, 4_000), event(20, 2_000), event(30, 50)],
            ..TraceData::default()
        };
        let c = ctx_with_trace(vec![snapshot(0, Vec::new())], data);
        let result = IoBlockAnalyzer.analyze(&c).unwrap();
        let messages: Vec<&str> = result.findings.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "2 slow I/O operations detected (slowest: 4000ms on db.internal:5432)",
                "High total I/O time: 6050ms across 3 events",
                "I/O hotspot: db.internal:5432 (6050ms, 6.0 KB)",
            ]
        );
        assert_eq!(
            result.summary(),
            "No I/O blocked threads in dumps; trace: 3 I/O events, 6.0 KB"
        );
    }
}
