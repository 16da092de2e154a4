//! Built-in analyzers, one module each.

use crate::analyzer::Analyzer;

pub mod churn;
pub mod class_loading;
pub mod compiler;
pub mod deadlock;
pub mod gc;
pub mod io_block;
pub mod lock_contention;
pub mod native;
pub mod profiling;
pub mod progress;
pub mod similar_stack;
pub mod stack_group;
pub mod thread_pool;
pub mod verdict;

pub use churn::ThreadChurnAnalyzer;
pub use class_loading::ClassLoadingAnalyzer;
pub use compiler::CompilerAnalyzer;
pub use deadlock::DeadlockAnalyzer;
pub use gc::GcActivityAnalyzer;
pub use io_block::IoBlockAnalyzer;
pub use lock_contention::LockContentionAnalyzer;
pub use native::NativeResourceAnalyzer;
pub use profiling::TraceProfilingAnalyzer;
pub use progress::ThreadProgressAnalyzer;
pub use similar_stack::SimilarStackAnalyzer;
pub use stack_group::StackGroupAnalyzer;
pub use thread_pool::ThreadPoolAnalyzer;
pub use verdict::VerdictAnalyzer;

/// Fresh instances of every built-in analyzer, in registration order.
pub fn builtin() -> Vec<Box<dyn Analyzer>> {
    vec![
        Box::new(VerdictAnalyzer),
        Box::new(DeadlockAnalyzer),
        Box::new(ThreadProgressAnalyzer),
        Box::new(LockContentionAnalyzer),
        Box::new(TraceProfilingAnalyzer),
        Box::new(ThreadChurnAnalyzer),
        Box::new(IoBlockAnalyzer),
        Box::new(GcActivityAnalyzer),
        Box::new(ThreadPoolAnalyzer),
        Box::new(SimilarStackAnalyzer::default()),
        Box::new(NativeResourceAnalyzer),
        Box::new(CompilerAnalyzer),
        Box::new(ClassLoadingAnalyzer),
        Box::new(StackGroupAnalyzer::default()),
    ]
}

/// Percentage of `part` in `total`, zero for an empty total.
pub(crate) fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}
