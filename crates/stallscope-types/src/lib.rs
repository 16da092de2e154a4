//! Snapshot types shared by the stallscope analysis engine and its adapters.
//!
//! A [`Snapshot`] is one point-in-time capture of every thread in a managed
//! runtime process. Snapshots are produced once by a parser and never
//! mutated afterwards; the analysis crate only ever borrows them.

use std::fmt;

use facet::Facet;

pub mod trace;

// ── Snapshot ─────────────────────────────────────────────────────

/// One thread dump.
#[derive(Debug, Clone, Facet)]
pub struct Snapshot {
    /// Capture time in unix milliseconds.
    pub timestamp_ms: i64,
    /// Runtime banner line, e.g. the VM name and version.
    #[facet(skip_unless_truthy)]
    pub runtime_info: Option<String>,
    #[facet(default)]
    pub threads: Vec<ThreadRecord>,
    /// Deadlocks the runtime diagnosed itself.
    #[facet(default)]
    pub reported_deadlocks: Vec<ReportedDeadlock>,
    #[facet(skip_unless_truthy)]
    pub native_resources: Option<NativeResources>,
    /// Where the snapshot came from (file name, "jcmd", ...).
    #[facet(skip_unless_truthy)]
    pub source: Option<String>,
}

impl Snapshot {
    pub fn new(timestamp_ms: i64, threads: Vec<ThreadRecord>) -> Self {
        Self {
            timestamp_ms,
            runtime_info: None,
            threads,
            reported_deadlocks: Vec::new(),
            native_resources: None,
            source: None,
        }
    }

    pub fn with_reported_deadlocks(mut self, deadlocks: Vec<ReportedDeadlock>) -> Self {
        self.reported_deadlocks = deadlocks;
        self
    }

    pub fn with_native_resources(mut self, resources: NativeResources) -> Self {
        self.native_resources = Some(resources);
        self
    }

    pub fn thread_named(&self, name: &str) -> Option<&ThreadRecord> {
        self.threads.iter().find(|t| t.name.as_deref() == Some(name))
    }
}

/// Native interface resource counters reported at the bottom of a dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct NativeResources {
    #[facet(skip_unless_truthy)]
    pub global_refs: Option<u64>,
    #[facet(skip_unless_truthy)]
    pub weak_refs: Option<u64>,
    #[facet(skip_unless_truthy)]
    pub memory_bytes: Option<u64>,
}

// ── Threads ──────────────────────────────────────────────────────

/// Execution state of a thread. The set is closed; `Terminated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Facet)]
#[facet(rename_all = "snake_case")]
#[repr(u8)]
pub enum ThreadState {
    New,
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
    Terminated,
}

impl ThreadState {
    pub const ALL: [ThreadState; 6] = [
        ThreadState::New,
        ThreadState::Runnable,
        ThreadState::Blocked,
        ThreadState::Waiting,
        ThreadState::TimedWaiting,
        ThreadState::Terminated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::New => "NEW",
            ThreadState::Runnable => "RUNNABLE",
            ThreadState::Blocked => "BLOCKED",
            ThreadState::Waiting => "WAITING",
            ThreadState::TimedWaiting => "TIMED_WAITING",
            ThreadState::Terminated => "TERMINATED",
        }
    }

    pub fn is_waiting(self) -> bool {
        matches!(self, ThreadState::Waiting | ThreadState::TimedWaiting)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One thread as it appears in a single snapshot.
///
/// `name` may repeat across unrelated threads, `logical_id` may be reused
/// over the process lifetime, `native_id` is the most stable key.
#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct ThreadRecord {
    #[facet(skip_unless_truthy)]
    pub name: Option<String>,
    #[facet(skip_unless_truthy)]
    pub logical_id: Option<u64>,
    #[facet(skip_unless_truthy)]
    pub native_id: Option<u64>,
    #[facet(skip_unless_truthy)]
    pub priority: Option<i32>,
    #[facet(default)]
    pub daemon: bool,
    #[facet(skip_unless_truthy)]
    pub state: Option<ThreadState>,
    #[facet(skip_unless_truthy)]
    pub cpu_time_ms: Option<f64>,
    #[facet(skip_unless_truthy)]
    pub elapsed_time_ms: Option<f64>,
    /// Innermost frame first.
    #[facet(default)]
    pub stack: Vec<StackFrame>,
    #[facet(default)]
    pub locks: Vec<LockRecord>,
    /// Lock id the thread is parked or blocked on, when the dump names one.
    #[facet(skip_unless_truthy)]
    pub waiting_on: Option<String>,
    #[facet(skip_unless_truthy)]
    pub additional_info: Option<String>,
}

impl ThreadRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn name_or_empty(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn is_in(&self, state: ThreadState) -> bool {
        self.state == Some(state)
    }

    pub fn top_frame(&self) -> Option<&StackFrame> {
        self.stack.first()
    }

    /// Ids of the locks this thread holds.
    pub fn held_locks(&self) -> impl Iterator<Item = &str> {
        self.locks
            .iter()
            .filter(|l| l.kind == LockKind::Locked)
            .map(|l| l.id.as_str())
    }

    /// Lock this thread waits to enter: the explicit waiting-on id, else the
    /// first waiting-to-lock record.
    pub fn awaited_lock(&self) -> Option<&str> {
        self.waiting_on.as_deref().or_else(|| {
            self.locks
                .iter()
                .find(|l| l.kind == LockKind::WaitingToLock)
                .map(|l| l.id.as_str())
        })
    }
}

// ── Stack frames ─────────────────────────────────────────────────

/// A single stack frame. Two frames are equal iff every field is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Facet)]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    #[facet(skip_unless_truthy)]
    pub file_name: Option<String>,
    #[facet(skip_unless_truthy)]
    pub line_number: Option<u32>,
    #[facet(default)]
    pub native: bool,
}

impl StackFrame {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            file_name: None,
            line_number: None,
            native: false,
        }
    }

    pub fn native(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            native: true,
            ..Self::new(class_name, method_name)
        }
    }

    pub fn at(mut self, file_name: impl Into<String>, line_number: u32) -> Self {
        self.file_name = Some(file_name.into());
        self.line_number = Some(line_number);
        self
    }

    /// `Class.method`, the key used for signatures.
    pub fn qualified_method(&self) -> String {
        format!("{}.{}", self.class_name, self.method_name)
    }

    /// Class name without its package prefix.
    pub fn simple_class_name(&self) -> &str {
        simple_class_name(&self.class_name)
    }

    /// `SimpleClass.method`.
    pub fn short_method(&self) -> String {
        format!("{}.{}", self.simple_class_name(), self.method_name)
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}.{}", self.class_name, self.method_name)?;
        if self.native {
            return f.write_str("(Native Method)");
        }
        match (&self.file_name, self.line_number) {
            (Some(file), Some(line)) => write!(f, "({file}:{line})"),
            (Some(file), None) => write!(f, "({file})"),
            _ => Ok(()),
        }
    }
}

/// Strips the package prefix from a fully qualified class name.
pub fn simple_class_name(class_name: &str) -> &str {
    match class_name.rfind('.') {
        Some(idx) => &class_name[idx + 1..],
        None => class_name,
    }
}

// ── Locks ────────────────────────────────────────────────────────

/// How a thread relates to a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Facet)]
#[facet(rename_all = "snake_case")]
#[repr(u8)]
pub enum LockKind {
    Locked,
    WaitingToLock,
    WaitingOn,
    ParkingToWaitFor,
}

impl LockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LockKind::Locked => "locked",
            LockKind::WaitingToLock => "waiting to lock",
            LockKind::WaitingOn => "waiting on",
            LockKind::ParkingToWaitFor => "parking to wait for",
        }
    }

    pub fn is_wait(self) -> bool {
        !matches!(self, LockKind::Locked)
    }
}

/// A lock line from a thread's stack section.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct LockRecord {
    /// Identity key, typically an address like `0x000000076ab2c0f8`.
    pub id: String,
    #[facet(skip_unless_truthy)]
    pub class_name: Option<String>,
    pub kind: LockKind,
}

impl LockRecord {
    pub fn new(id: impl Into<String>, kind: LockKind) -> Self {
        Self {
            id: id.into(),
            class_name: None,
            kind,
        }
    }

    pub fn of_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }
}

// ── Runtime-reported deadlocks ───────────────────────────────────

/// A deadlock the runtime diagnosed itself. Trusted outright.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct ReportedDeadlock {
    pub threads: Vec<DeadlockedThread>,
}

impl ReportedDeadlock {
    pub fn thread_names(&self) -> Vec<&str> {
        self.threads.iter().map(|t| t.thread_name.as_str()).collect()
    }
}

/// One participant of a [`ReportedDeadlock`].
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct DeadlockedThread {
    pub thread_name: String,
    #[facet(skip_unless_truthy)]
    pub waiting_for_monitor: Option<String>,
    #[facet(skip_unless_truthy)]
    pub waiting_for_object: Option<String>,
    #[facet(skip_unless_truthy)]
    pub waiting_for_object_type: Option<String>,
    #[facet(skip_unless_truthy)]
    pub held_by: Option<String>,
    #[facet(default)]
    pub stack: Vec<StackFrame>,
    #[facet(default)]
    pub locks: Vec<LockRecord>,
}

impl DeadlockedThread {
    pub fn named(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
            waiting_for_monitor: None,
            waiting_for_object: None,
            waiting_for_object_type: None,
            held_by: None,
            stack: Vec::new(),
            locks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_display_forms() {
        let native = StackFrame::native("java.lang.Object", "wait");
        assert_eq!(native.to_string(), "at java.lang.Object.wait(Native Method)");

        let with_line = StackFrame::new("com.acme.Worker", "run").at("Worker.java", 42);
        assert_eq!(with_line.to_string(), "at com.acme.Worker.run(Worker.java:42)");

        let mut file_only = StackFrame::new("com.acme.Worker", "run");
        file_only.file_name = Some("Worker.java".to_string());
        assert_eq!(file_only.to_string(), "at com.acme.Worker.run(Worker.java)");

        let bare = StackFrame::new("com.acme.Worker", "run");
        assert_eq!(bare.to_string(), "at com.acme.Worker.run");
    }

    #[test]
    fn frames_compare_all_fields() {
        let a = StackFrame::new("A", "m").at("A.java", 1);
        let b = StackFrame::new("A", "m").at("A.java", 2);
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn simple_class_name_strips_package() {
        assert_eq!(simple_class_name("java.net.SocketInputStream"), "SocketInputStream");
        assert_eq!(simple_class_name("Bare"), "Bare");
        assert_eq!(
            StackFrame::new("java.lang.Thread", "sleep").short_method(),
            "Thread.sleep"
        );
    }

    #[test]
    fn awaited_lock_prefers_waiting_on() {
        let mut t = ThreadRecord::named("w");
        t.locks.push(LockRecord::new("0x2", LockKind::WaitingToLock));
        assert_eq!(t.awaited_lock(), Some("0x2"));
        t.waiting_on = Some("0x9".to_string());
        assert_eq!(t.awaited_lock(), Some("0x9"));
    }

    #[test]
    fn held_locks_only_lists_locked_entries() {
        let mut t = ThreadRecord::named("w");
        t.locks.push(LockRecord::new("0x1", LockKind::Locked));
        t.locks.push(LockRecord::new("0x2", LockKind::WaitingOn));
        t.locks.push(LockRecord::new("0x3", LockKind::Locked));
        assert_eq!(t.held_locks().collect::<Vec<_>>(), vec!["0x1", "0x3"]);
    }
}
