//! Affinity-aware stream executors.
//!
//! A `StreamExecutor` runs one device's workload across a fixed set of
//! long-lived worker threads ("streams"), each bound to a NUMA node, core
//! range or core class according to [`StreamConfig`].

mod config;
mod stream;
mod streams_executor;

pub use config::{
    CoreClassPreference, PriorityTier, StreamConfig, ThreadBindingPolicy,
    KEY_STREAMS, KEY_THREADS_PER_STREAM, KEY_THREAD_BINDING,
};
pub use stream::{CoreBindingObserver, StreamContext, WorkerObserver};
pub use streams_executor::StreamExecutor;

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes tasks on behalf of a pipeline stage.
pub trait TaskExecutor: Send + Sync {
    /// Enqueue `task` for execution, FIFO relative to other `execute` calls.
    fn execute(&self, task: Task);

    /// Deferred submission; inline executors may run on the calling thread.
    fn run(&self, task: Task) {
        self.execute(task);
    }
}

/// Runs every task immediately on the calling thread.
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}
