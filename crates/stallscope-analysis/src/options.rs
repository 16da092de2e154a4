//! Immutable analysis configuration.

use std::fmt;

use regex::Regex;
use stallscope_types::ThreadRecord;

// ── Thresholds & toggles ────────────────────────────────────────

/// Numeric knobs shared by the analyzers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// CPU delta at or below which a RUNNABLE thread made no progress.
    pub cpu_epsilon_ms: f64,
    pub min_dumps_for_stall: usize,
    /// Fraction of snapshots a thread must look stuck in.
    pub stuck_thread_threshold: f64,
    pub long_held_lock_threshold_ms: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_epsilon_ms: 2.0,
            min_dumps_for_stall: 2,
            stuck_thread_threshold: 0.9,
            long_held_lock_threshold_ms: 5000,
        }
    }
}

/// Per-feature switches. Every feature is on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Toggles {
    pub detect_deadlocks: bool,
    pub detect_no_progress: bool,
    pub detect_long_held_locks: bool,
    pub group_identical_stacks: bool,
    pub group_similar_stacks: bool,
    pub track_thread_churn: bool,
}

impl Default for Toggles {
    fn default() -> Self {
        Self {
            detect_deadlocks: true,
            detect_no_progress: true,
            detect_long_held_locks: true,
            group_identical_stacks: true,
            group_similar_stacks: true,
            track_thread_churn: true,
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    InvalidPattern { pattern: String, message: String },
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPattern { pattern, message } => {
                write!(f, "invalid thread name pattern {pattern:?}: {message}")
            }
        }
    }
}

impl std::error::Error for OptionsError {}

// ── Options ─────────────────────────────────────────────────────

/// Thread filters, thresholds and feature toggles for one analysis run.
///
/// Built once through [`AnalysisOptions::builder`] and never mutated.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    include_daemon: bool,
    include_gc: bool,
    include_vm: bool,
    ignore_patterns: Vec<Regex>,
    focus_patterns: Vec<Regex>,
    thresholds: Thresholds,
    toggles: Toggles,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            include_daemon: false,
            include_gc: false,
            include_vm: false,
            ignore_patterns: Vec::new(),
            focus_patterns: Vec::new(),
            thresholds: Thresholds::default(),
            toggles: Toggles::default(),
        }
    }
}

impl AnalysisOptions {
    pub fn builder() -> AnalysisOptionsBuilder {
        AnalysisOptionsBuilder::default()
    }

    pub fn include_daemon(&self) -> bool {
        self.include_daemon
    }

    pub fn include_gc(&self) -> bool {
        self.include_gc
    }

    pub fn include_vm(&self) -> bool {
        self.include_vm
    }

    pub fn ignore_patterns(&self) -> impl Iterator<Item = &str> {
        self.ignore_patterns.iter().map(Regex::as_str)
    }

    pub fn focus_patterns(&self) -> impl Iterator<Item = &str> {
        self.focus_patterns.iter().map(Regex::as_str)
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn toggles(&self) -> &Toggles {
        &self.toggles
    }

    /// Thread filter predicate.
    ///
    /// Focus patterns are checked first (a thread must match one of them
    /// when any are configured), then ignore patterns, then the daemon,
    /// GC and VM category excludes.
    pub fn accepts(&self, thread: &ThreadRecord) -> bool {
        let name = thread.name_or_empty();

        if !self.focus_patterns.is_empty() && !self.focus_patterns.iter().any(|p| p.is_match(name))
        {
            return false;
        }
        if self.ignore_patterns.iter().any(|p| p.is_match(name)) {
            return false;
        }
        if !self.include_daemon && thread.daemon {
            return false;
        }
        if !self.include_gc && is_gc_thread(name) {
            return false;
        }
        if !self.include_vm && is_vm_thread(name) {
            return false;
        }
        true
    }
}

const GC_NAME_PREFIXES: &[&str] = &["GC ", "G1 ", "ZGC ", "Shenandoah "];

const VM_THREAD_NAMES: &[&str] = &[
    "VM Thread",
    "VM Periodic Task Thread",
    "Finalizer",
    "Reference Handler",
    "Signal Dispatcher",
    "Attach Listener",
    "Service Thread",
    "Common-Cleaner",
    "Notification Thread",
];

/// Garbage collector worker, by name.
pub fn is_gc_thread(name: &str) -> bool {
    GC_NAME_PREFIXES.iter().any(|p| name.starts_with(p)) || name.contains("GC Thread")
}

/// Runtime-internal housekeeping thread, by name.
pub fn is_vm_thread(name: &str) -> bool {
    name.starts_with("VM ") || VM_THREAD_NAMES.contains(&name)
}

// ── Builder ─────────────────────────────────────────────────────

/// Staged builder for [`AnalysisOptions`]. Patterns are compiled in
/// [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptionsBuilder {
    include_daemon: bool,
    include_gc: bool,
    include_vm: bool,
    ignore_patterns: Vec<String>,
    focus_patterns: Vec<String>,
    thresholds: Thresholds,
    toggles: Toggles,
}

impl AnalysisOptionsBuilder {
    pub fn include_daemon(mut self, include: bool) -> Self {
        self.include_daemon = include;
        self
    }

    pub fn include_gc(mut self, include: bool) -> Self {
        self.include_gc = include;
        self
    }

    pub fn include_vm(mut self, include: bool) -> Self {
        self.include_vm = include;
        self
    }

    /// Shorthand for including daemon, GC and VM threads.
    pub fn include_all(self) -> Self {
        self.include_daemon(true).include_gc(true).include_vm(true)
    }

    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.ignore_patterns.push(pattern.into());
        self
    }

    pub fn focus(mut self, pattern: impl Into<String>) -> Self {
        self.focus_patterns.push(pattern.into());
        self
    }

    pub fn cpu_epsilon_ms(mut self, epsilon: f64) -> Self {
        self.thresholds.cpu_epsilon_ms = epsilon;
        self
    }

    pub fn min_dumps_for_stall(mut self, count: usize) -> Self {
        self.thresholds.min_dumps_for_stall = count;
        self
    }

    pub fn stuck_thread_threshold(mut self, fraction: f64) -> Self {
        self.thresholds.stuck_thread_threshold = fraction;
        self
    }

    pub fn long_held_lock_threshold_ms(mut self, ms: u64) -> Self {
        self.thresholds.long_held_lock_threshold_ms = ms;
        self
    }

    pub fn toggles(mut self, toggles: Toggles) -> Self {
        self.toggles = toggles;
        self
    }

    pub fn detect_deadlocks(mut self, on: bool) -> Self {
        self.toggles.detect_deadlocks = on;
        self
    }

    pub fn detect_no_progress(mut self, on: bool) -> Self {
        self.toggles.detect_no_progress = on;
        self
    }

    pub fn detect_long_held_locks(mut self, on: bool) -> Self {
        self.toggles.detect_long_held_locks = on;
        self
    }

    pub fn group_identical_stacks(mut self, on: bool) -> Self {
        self.toggles.group_identical_stacks = on;
        self
    }

    pub fn group_similar_stacks(mut self, on: bool) -> Self {
        self.toggles.group_similar_stacks = on;
        self
    }

    pub fn track_thread_churn(mut self, on: bool) -> Self {
        self.toggles.track_thread_churn = on;
        self
    }

    pub fn build(self) -> Result<AnalysisOptions, OptionsError> {
        Ok(AnalysisOptions {
            include_daemon: self.include_daemon,
            include_gc: self.include_gc,
            include_vm: self.include_vm,
            ignore_patterns: compile_all(self.ignore_patterns)?,
            focus_patterns: compile_all(self.focus_patterns)?,
            thresholds: self.thresholds,
            toggles: self.toggles,
        })
    }
}

fn compile_all(patterns: Vec<String>) -> Result<Vec<Regex>, OptionsError> {
    patterns
        .into_iter()
        .map(|pattern| {
            Regex::new(&pattern).map_err(|e| OptionsError::InvalidPattern {
                message: e.to_string(),
                pattern,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(name: &str, daemon: bool) -> ThreadRecord {
        ThreadRecord {
            daemon,
            ..ThreadRecord::named(name)
        }
    }

    #[test]
    fn defaults() {
        let opts = AnalysisOptions::default();
        assert!(!opts.include_daemon());
        assert!(!opts.include_gc());
        assert!(!opts.include_vm());
        assert_eq!(opts.thresholds().cpu_epsilon_ms, 2.0);
        assert_eq!(opts.thresholds().min_dumps_for_stall, 2);
        assert_eq!(opts.thresholds().long_held_lock_threshold_ms, 5000);
        assert!(opts.toggles().detect_deadlocks);
        assert!(opts.toggles().track_thread_churn);
    }

    #[test]
    fn category_excludes() {
        let opts = AnalysisOptions::default();
        assert!(opts.accepts(&thread("main", false)));
        assert!(!opts.accepts(&thread("pool-1-thread-1", true)));
        assert!(!opts.accepts(&thread("GC Thread#0", false)));
        assert!(!opts.accepts(&thread("G1 Refine#0", false)));
        assert!(!opts.accepts(&thread("VM Thread", false)));
        assert!(!opts.accepts(&thread("Finalizer", false)));

        let all = AnalysisOptions::builder().include_all().build().unwrap();
        assert!(all.accepts(&thread("Finalizer", true)));
        assert!(all.accepts(&thread("GC Thread#0", false)));
    }

    #[test]
    fn focus_then_ignore() {
        let opts = AnalysisOptions::builder()
            .focus("^worker")
            .ignore("-debug$")
            .build()
            .unwrap();
        assert!(opts.accepts(&thread("worker-1", false)));
        assert!(!opts.accepts(&thread("main", false)));
        assert!(!opts.accepts(&thread("worker-debug", false)));
    }

    #[test]
    fn ignore_uses_find_semantics() {
        let opts = AnalysisOptions::builder().ignore("Timer").build().unwrap();
        assert!(!opts.accepts(&thread("my-Timer-3", false)));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let err = AnalysisOptions::builder().focus("(").build().unwrap_err();
        assert!(matches!(err, OptionsError::InvalidPattern { .. }));
    }

    #[test]
    fn vm_and_gc_name_rules() {
        assert!(is_vm_thread("VM Periodic Task Thread"));
        assert!(is_vm_thread("VM Operation"));
        assert!(!is_vm_thread("Finalizer-2"));
        assert!(is_gc_thread("ZGC Worker"));
        assert!(is_gc_thread("Parallel GC Thread#1"));
        assert!(!is_gc_thread("GCLogger"));
    }
}
