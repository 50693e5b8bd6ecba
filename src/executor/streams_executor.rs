//! The stream executor: a fixed pool of affinity-bound worker threads
//! draining a shared task queue.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use super::config::{PriorityTier, StreamConfig};
use super::stream::{CoreBindingObserver, StreamCell, StreamRegistry, WorkerObserver};
use super::{Task, TaskExecutor};
use crate::error::Result;
use crate::queue::ThreadSafeQueue;
use crate::telemetry;
use crate::topology::CoreTopology;

struct Inner {
    config: StreamConfig,
    queue: ThreadSafeQueue<Task>,
    registry: StreamRegistry,
    observers: Vec<Arc<dyn WorkerObserver>>,
}

/// Affinity-aware thread pool with a shared FIFO task queue.
///
/// With `streams == 0` no threads are spawned and [`run`](Self::run)
/// executes inline on the calling thread; `execute` still queues, but
/// nothing drains the queue in that mode, so inline-mode callers use `run`.
pub struct StreamExecutor {
    inner: Arc<Inner>,
    threads: Vec<JoinHandle<()>>,
}

impl StreamExecutor {
    /// Build against the detected host topology.
    pub fn new(config: StreamConfig) -> Result<Self> {
        Self::with_topology(config, CoreTopology::detect())
    }

    /// Build against an explicit topology (deterministic in tests).
    pub fn with_topology(config: StreamConfig, topology: CoreTopology) -> Result<Self> {
        let binding: Arc<dyn WorkerObserver> =
            Arc::new(CoreBindingObserver::new(&config, topology.clone()));
        Self::with_observers(config, topology, vec![binding])
    }

    /// Build with a custom set of worker attach/detach observers. The
    /// default binding observer is not added; callers own the full list.
    pub fn with_observers(
        config: StreamConfig,
        topology: CoreTopology,
        observers: Vec<Arc<dyn WorkerObserver>>,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            registry: StreamRegistry::new(&config, &topology),
            queue: ThreadSafeQueue::new(),
            observers,
            config,
        });

        let mut threads = Vec::with_capacity(inner.config.streams);
        for stream_index in 0..inner.config.streams {
            let inner = Arc::clone(&inner);
            let name = format!("{}-{}", inner.config.name, stream_index);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&inner))
                .map_err(|e| {
                    crate::error::CoreError::Config(format!(
                        "failed to spawn stream thread: {e}"
                    ))
                })?;
            threads.push(handle);
        }
        Ok(Self { inner, threads })
    }

    /// Enqueue a task for execution by some worker thread, FIFO relative to
    /// other enqueued tasks.
    pub fn execute(&self, task: Task) {
        telemetry::record_task_enqueued(&self.inner.config.name);
        self.inner.queue.push(task);
    }

    /// Deferred submission.
    ///
    /// Inline mode (`streams == 0`) executes on the calling thread unless
    /// that thread is already draining its deferred queue, in which case the
    /// task is appended instead of starting a nested drain. Otherwise
    /// identical to [`execute`](Self::execute).
    pub fn run(&self, task: Task) {
        if self.inner.config.streams == 0 {
            self.defer(task);
        } else {
            self.execute(task);
        }
    }

    fn defer(&self, task: Task) {
        let cell = self.inner.registry.obtain();
        {
            let mut deferred = cell.deferred.lock();
            deferred.queue.push_back(task);
            if deferred.draining {
                // A task running on this thread re-entered `run`; the active
                // drain below will pick this up without growing the stack.
                return;
            }
            deferred.draining = true;
        }

        // Clears the drain flag even if a task panics, so later inline
        // submissions on this thread still drain.
        struct DrainGuard<'a>(&'a StreamCell);
        impl Drop for DrainGuard<'_> {
            fn drop(&mut self) {
                self.0.deferred.lock().draining = false;
            }
        }
        let _drain = DrainGuard(&cell);

        loop {
            let next = cell.deferred.lock().queue.pop_front();
            match next {
                Some(next) => next(),
                None => break,
            }
        }
    }

    /// Configured stream count.
    pub fn stream_count(&self) -> usize {
        self.inner.config.streams
    }

    /// Number of live worker threads.
    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    /// Tasks queued but not yet picked up.
    pub fn queued_tasks(&self) -> usize {
        self.inner.queue.len()
    }
}

impl TaskExecutor for StreamExecutor {
    fn execute(&self, task: Task) {
        StreamExecutor::execute(self, task);
    }

    fn run(&self, task: Task) {
        StreamExecutor::run(self, task);
    }
}

impl Drop for StreamExecutor {
    fn drop(&mut self) {
        // The stop signal is the queue closing: it wakes all waiters, and
        // tasks still queued are dropped without execution.
        self.inner.queue.close();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        debug!(executor = %self.inner.config.name, "stream executor shut down");
    }
}

fn worker_loop(inner: &Inner) {
    apply_thread_priority(inner.config.priority);
    let cell: Arc<StreamCell> = inner.registry.obtain();

    loop {
        // `pop` returns None once the queue closes, even if the stop flag
        // raced ahead of a late enqueue; a dequeued task always runs to
        // completion first.
        let Some(task) = inner.queue.pop() else { break };
        for observer in &inner.observers {
            observer.on_attach(&cell.ctx);
        }
        task();
        for observer in &inner.observers {
            observer.on_detach(&cell.ctx);
        }
    }
    inner.registry.retire_current();
}

#[cfg(unix)]
fn apply_thread_priority(tier: PriorityTier) {
    if tier == PriorityTier::Normal {
        return;
    }
    let nice = tier.nice_value();
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if rc != 0 {
        warn!(nice, "failed to set stream thread priority; continuing at default");
    }
}

#[cfg(not(unix))]
fn apply_thread_priority(tier: PriorityTier) {
    if tier != PriorityTier::Normal {
        warn!(?tier, "thread priority tiers unsupported on this platform");
    }
}
