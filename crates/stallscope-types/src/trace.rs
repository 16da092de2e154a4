//! Profiling-trace events recorded alongside the thread dumps.
//!
//! Only the decoded event model lives here. Decoding a binary recording is
//! the parser's job.

use facet::Facet;

/// All events of one recording (or a time slice of it).
#[derive(Debug, Clone, Default, Facet)]
pub struct TraceData {
    #[facet(skip_unless_truthy)]
    pub source: Option<String>,
    #[facet(default)]
    pub execution_samples: Vec<MethodSample>,
    #[facet(default)]
    pub lock_events: Vec<LockEvent>,
    #[facet(default)]
    pub allocation_events: Vec<AllocationEvent>,
    #[facet(default)]
    pub class_load_events: Vec<ClassLoadEvent>,
    #[facet(default)]
    pub io_events: Vec<IoEvent>,
}

impl TraceData {
    pub fn is_empty(&self) -> bool {
        self.execution_samples.is_empty()
            && self.lock_events.is_empty()
            && self.allocation_events.is_empty()
            && self.class_load_events.is_empty()
            && self.io_events.is_empty()
    }

    pub fn event_count(&self) -> usize {
        self.execution_samples.len()
            + self.lock_events.len()
            + self.allocation_events.len()
            + self.class_load_events.len()
            + self.io_events.len()
    }

    fn timed_events(&self) -> impl Iterator<Item = i64> + '_ {
        self.execution_samples
            .iter()
            .map(|s| s.timestamp_ms)
            .chain(self.lock_events.iter().map(|e| e.timestamp_ms))
            .chain(self.io_events.iter().map(|e| e.timestamp_ms))
    }

    /// Earliest sample, lock or I/O event.
    pub fn start_ms(&self) -> Option<i64> {
        self.timed_events().min()
    }

    /// Latest sample, lock or I/O event.
    pub fn end_ms(&self) -> Option<i64> {
        self.timed_events().max()
    }

    /// Events with `start_ms <= timestamp <= end_ms`.
    pub fn filter_by_time_range(&self, start_ms: i64, end_ms: i64) -> TraceData {
        let within = |ts: i64| ts >= start_ms && ts <= end_ms;
        TraceData {
            source: self.source.clone(),
            execution_samples: self
                .execution_samples
                .iter()
                .filter(|e| within(e.timestamp_ms))
                .cloned()
                .collect(),
            lock_events: self
                .lock_events
                .iter()
                .filter(|e| within(e.timestamp_ms))
                .cloned()
                .collect(),
            allocation_events: self
                .allocation_events
                .iter()
                .filter(|e| within(e.timestamp_ms))
                .cloned()
                .collect(),
            class_load_events: self
                .class_load_events
                .iter()
                .filter(|e| within(e.timestamp_ms))
                .cloned()
                .collect(),
            io_events: self
                .io_events
                .iter()
                .filter(|e| within(e.timestamp_ms))
                .cloned()
                .collect(),
        }
    }

    pub fn samples_for_thread<'a>(
        &'a self,
        thread_name: &'a str,
    ) -> impl Iterator<Item = &'a MethodSample> + 'a {
        self.execution_samples
            .iter()
            .filter(move |s| s.thread_name.as_deref() == Some(thread_name))
    }

    pub fn io_events_for_thread<'a>(
        &'a self,
        thread_name: &'a str,
    ) -> impl Iterator<Item = &'a IoEvent> + 'a {
        self.io_events
            .iter()
            .filter(move |e| e.thread_name.as_deref() == Some(thread_name))
    }
}

/// A frame in a trace event's stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Facet)]
pub struct TraceFrame {
    pub class_name: String,
    pub method_name: String,
    #[facet(default)]
    pub line_number: u32,
}

impl TraceFrame {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            line_number: 0,
        }
    }

    pub fn qualified_method(&self) -> String {
        format!("{}.{}", self.class_name, self.method_name)
    }
}

fn top_method(frames: &[TraceFrame]) -> Option<String> {
    frames.first().map(TraceFrame::qualified_method)
}

/// A CPU execution sample.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct MethodSample {
    pub timestamp_ms: i64,
    #[facet(skip_unless_truthy)]
    pub thread_name: Option<String>,
    #[facet(skip_unless_truthy)]
    pub thread_id: Option<u64>,
    #[facet(skip_unless_truthy)]
    pub thread_state: Option<String>,
    #[facet(default)]
    pub frames: Vec<TraceFrame>,
}

impl MethodSample {
    pub fn top_method(&self) -> Option<String> {
        top_method(&self.frames)
    }
}

/// Whether a lock event was a contended enter or a monitor wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[facet(rename_all = "snake_case")]
#[repr(u8)]
pub enum LockEventKind {
    Enter,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct LockEvent {
    pub timestamp_ms: i64,
    #[facet(skip_unless_truthy)]
    pub thread_name: Option<String>,
    #[facet(skip_unless_truthy)]
    pub monitor_class: Option<String>,
    #[facet(default)]
    pub duration_ms: u64,
    #[facet(skip_unless_truthy)]
    pub previous_owner: Option<String>,
    pub kind: LockEventKind,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct AllocationEvent {
    pub timestamp_ms: i64,
    #[facet(skip_unless_truthy)]
    pub thread_name: Option<String>,
    #[facet(skip_unless_truthy)]
    pub object_class: Option<String>,
    pub size_bytes: u64,
    #[facet(default)]
    pub frames: Vec<TraceFrame>,
}

impl AllocationEvent {
    pub fn allocation_site(&self) -> Option<String> {
        top_method(&self.frames)
    }
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct ClassLoadEvent {
    pub timestamp_ms: i64,
    #[facet(skip_unless_truthy)]
    pub loaded_class: Option<String>,
    #[facet(skip_unless_truthy)]
    pub thread_name: Option<String>,
    #[facet(skip_unless_truthy)]
    pub class_loader: Option<String>,
    #[facet(default)]
    pub duration_ms: u64,
}

impl ClassLoadEvent {
    pub fn loader_or_bootstrap(&self) -> &str {
        self.class_loader.as_deref().unwrap_or("bootstrap")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Facet)]
#[facet(rename_all = "snake_case")]
#[repr(u8)]
pub enum IoEventKind {
    FileRead,
    FileWrite,
    SocketRead,
    SocketWrite,
}

impl IoEventKind {
    pub fn display_name(self) -> &'static str {
        match self {
            IoEventKind::FileRead => "File Read",
            IoEventKind::FileWrite => "File Write",
            IoEventKind::SocketRead => "Socket Read",
            IoEventKind::SocketWrite => "Socket Write",
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, IoEventKind::FileRead | IoEventKind::SocketRead)
    }

    pub fn is_file(self) -> bool {
        matches!(self, IoEventKind::FileRead | IoEventKind::FileWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct IoEvent {
    pub timestamp_ms: i64,
    #[facet(skip_unless_truthy)]
    pub thread_name: Option<String>,
    pub kind: IoEventKind,
    /// Set for file I/O.
    #[facet(skip_unless_truthy)]
    pub path: Option<String>,
    /// Set for socket I/O.
    #[facet(skip_unless_truthy)]
    pub host: Option<String>,
    #[facet(skip_unless_truthy)]
    pub port: Option<u16>,
    #[facet(default)]
    pub bytes: u64,
    #[facet(default)]
    pub duration_ms: u64,
    #[facet(default)]
    pub frames: Vec<TraceFrame>,
}

impl IoEvent {
    /// Path for file I/O, `host:port` for sockets.
    pub fn target(&self) -> String {
        if let Some(path) = &self.path {
            return path.clone();
        }
        match (&self.host, self.port) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.clone(),
            _ => "unknown".to_string(),
        }
    }

    pub fn io_site(&self) -> Option<String> {
        top_method(&self.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64, thread: &str) -> MethodSample {
        MethodSample {
            timestamp_ms: ts,
            thread_name: Some(thread.to_string()),
            thread_id: None,
            thread_state: None,
            frames: vec![TraceFrame::new("com.acme.Hot", "spin")],
        }
    }

    #[test]
    fn time_range_is_inclusive() {
        let data = TraceData {
            execution_samples: vec![sample(100, "a"), sample(200, "b"), sample(300, "a")],
            ..TraceData::default()
        };
        let slice = data.filter_by_time_range(100, 200);
        assert_eq!(slice.execution_samples.len(), 2);
        assert_eq!(data.start_ms(), Some(100));
        assert_eq!(data.end_ms(), Some(300));
        assert_eq!(data.samples_for_thread("a").count(), 2);
    }

    #[test]
    fn empty_trace_has_no_bounds() {
        let data = TraceData::default();
        assert!(data.is_empty());
        assert_eq!(data.start_ms(), None);
    }

    #[test]
    fn io_target_forms() {
        let mut ev = IoEvent {
            timestamp_ms: 0,
            thread_name: None,
            kind: IoEventKind::SocketRead,
            path: None,
            host: Some("db".to_string()),
            port: Some(5432),
            bytes: 0,
            duration_ms: 0,
            frames: Vec::new(),
        };
        assert_eq!(ev.target(), "db:5432");
        ev.port = None;
        assert_eq!(ev.target(), "db");
        ev.host = None;
        assert_eq!(ev.target(), "unknown");
    }
}
