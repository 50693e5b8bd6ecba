//! Per-thread stream contexts and hardware binding.
//!
//! Each worker thread owns one `Stream`: its id, assigned NUMA node and
//! core class, plus a deferred-task queue for inline execution. Streams are
//! kept in an explicit per-thread slot table rather than thread-local
//! storage, and hardware binding happens through generic attach/detach
//! hooks so any concurrency backend can drive them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::config::{CoreClassPreference, StreamConfig, ThreadBindingPolicy};
use super::Task;
use crate::topology::{CoreClass, CoreTopology, HybridLayout};

/// Immutable identity of one stream.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub stream_id: usize,
    pub numa_node: usize,
    pub core_class: Option<CoreClass>,
}

/// Deferred tasks of the owning thread. The drain flag suppresses nested
/// drains when a running task re-enters `run` on the same thread.
pub(super) struct Deferred {
    pub queue: VecDeque<Task>,
    pub draining: bool,
}

/// One stream slot: context plus the owner thread's deferred queue.
pub(super) struct StreamCell {
    pub ctx: StreamContext,
    pub deferred: Mutex<Deferred>,
}

struct StreamIdPool {
    next: usize,
    free: VecDeque<usize>,
}

impl StreamIdPool {
    fn allocate(&mut self) -> usize {
        self.free.pop_front().unwrap_or_else(|| {
            let id = self.next;
            self.next += 1;
            id
        })
    }

    fn release(&mut self, id: usize) {
        self.free.push_back(id);
    }
}

/// Explicit slot table mapping thread identity to its stream.
pub(super) struct StreamRegistry {
    slots: Mutex<HashMap<ThreadId, Arc<StreamCell>>>,
    ids: Mutex<StreamIdPool>,
    used_numa_nodes: Vec<usize>,
    streams: usize,
    preferred_core_class: CoreClassPreference,
    hybrid: Option<HybridLayout>,
}

impl StreamRegistry {
    pub fn new(config: &StreamConfig, topology: &CoreTopology) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ids: Mutex::new(StreamIdPool { next: 0, free: VecDeque::new() }),
            used_numa_nodes: used_numa_nodes(topology, config.streams),
            streams: config.streams,
            preferred_core_class: config.preferred_core_class,
            hybrid: match config.binding {
                ThreadBindingPolicy::HybridAware => topology.hybrid(),
                _ => None,
            },
        }
    }

    /// Stream of the calling thread, created on first use.
    pub fn obtain(&self) -> Arc<StreamCell> {
        let thread = std::thread::current().id();
        let mut slots = self.slots.lock();
        if let Some(cell) = slots.get(&thread) {
            return Arc::clone(cell);
        }
        let stream_id = self.ids.lock().allocate();
        let ctx = StreamContext {
            stream_id,
            numa_node: assign_numa_node(stream_id, self.streams, &self.used_numa_nodes),
            core_class: assign_core_class(
                stream_id,
                self.preferred_core_class,
                self.hybrid,
            ),
        };
        debug!(
            stream_id = ctx.stream_id,
            numa_node = ctx.numa_node,
            core_class = ?ctx.core_class,
            "stream created"
        );
        let cell = Arc::new(StreamCell {
            ctx,
            deferred: Mutex::new(Deferred { queue: VecDeque::new(), draining: false }),
        });
        slots.insert(thread, Arc::clone(&cell));
        cell
    }

    /// Retire the calling thread's stream, returning its id to the reuse
    /// pool. Called when a worker thread exits.
    pub fn retire_current(&self) {
        let thread = std::thread::current().id();
        if let Some(cell) = self.slots.lock().remove(&thread) {
            self.ids.lock().release(cell.ctx.stream_id);
        }
    }
}

/// NUMA nodes participating in stream placement: the first
/// `min(streams, nodes)` nodes, or all nodes in inline mode.
fn used_numa_nodes(topology: &CoreTopology, streams: usize) -> Vec<usize> {
    let nodes = topology.numa_nodes();
    if streams == 0 {
        nodes.to_vec()
    } else {
        nodes[..streams.min(nodes.len())].to_vec()
    }
}

/// Scale stream ids over the used nodes so consecutive streams share a node
/// when there are more streams than nodes.
fn assign_numa_node(stream_id: usize, streams: usize, used: &[usize]) -> usize {
    if streams == 0 {
        used[stream_id % used.len()]
    } else {
        let group = (streams + used.len() - 1) / used.len();
        used[(stream_id % streams) / group]
    }
}

/// Core class for one stream: fixed, or round-robin weighted by each
/// class's native concurrency.
fn assign_core_class(
    stream_id: usize,
    preference: CoreClassPreference,
    hybrid: Option<HybridLayout>,
) -> Option<CoreClass> {
    let hybrid = hybrid?;
    match preference {
        CoreClassPreference::Any => None,
        CoreClassPreference::Performance => Some(CoreClass::Performance),
        CoreClassPreference::Efficiency => Some(CoreClass::Efficiency),
        CoreClassPreference::RoundRobin => {
            let performance = hybrid.concurrency(CoreClass::Performance);
            let total = performance + hybrid.concurrency(CoreClass::Efficiency);
            if total == 0 {
                return None;
            }
            if stream_id % total < performance {
                Some(CoreClass::Performance)
            } else {
                Some(CoreClass::Efficiency)
            }
        }
    }
}

/// Hook invoked around task execution on a worker.
///
/// Generic seam for binding and bookkeeping: the executor calls `on_attach`
/// before running each task on a stream and `on_detach` after, so a backend
/// that migrates logical workers across OS threads can re-pin on every
/// migration.
pub trait WorkerObserver: Send + Sync {
    fn on_attach(&self, ctx: &StreamContext);
    fn on_detach(&self, ctx: &StreamContext);
}

/// Built-in observer applying the configured thread-binding policy.
///
/// Pin failures are non-fatal: logged, and the stream continues unpinned.
pub struct CoreBindingObserver {
    binding: ThreadBindingPolicy,
    binding_offset: usize,
    binding_step: usize,
    threads_per_stream: usize,
    topology: CoreTopology,
}

impl CoreBindingObserver {
    pub fn new(config: &StreamConfig, topology: CoreTopology) -> Self {
        Self {
            binding: config.binding,
            binding_offset: config.binding_offset,
            binding_step: config.binding_step.max(1),
            threads_per_stream: config.threads_per_stream.max(1),
            topology,
        }
    }

    /// Candidate logical CPUs for a stream, narrowed by core class under
    /// hybrid binding. Performance cores are assumed to enumerate first.
    fn candidate_cpus(&self, ctx: &StreamContext) -> Vec<usize> {
        match (self.binding, ctx.core_class, self.topology.hybrid()) {
            (ThreadBindingPolicy::HybridAware, Some(CoreClass::Performance), Some(h)) => {
                (0..h.performance_cores).collect()
            }
            (ThreadBindingPolicy::HybridAware, Some(CoreClass::Efficiency), Some(h)) => {
                (h.performance_cores..h.performance_cores + h.efficiency_cores).collect()
            }
            _ => (0..self.topology.logical_cpus()).collect(),
        }
    }

    fn pin_to_core(&self, ctx: &StreamContext) {
        let candidates = self.candidate_cpus(ctx);
        if candidates.is_empty() {
            return;
        }
        let offset = ctx.stream_id * self.threads_per_stream + self.binding_offset;
        let cpu = candidates[(offset * self.binding_step) % candidates.len()];
        if !core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
            warn!(
                stream_id = ctx.stream_id,
                cpu, "failed to pin stream thread; continuing unpinned"
            );
        }
    }

    #[cfg(unix)]
    fn bind_to_node(&self, ctx: &StreamContext) {
        let cpus = self.topology.cpus_of_node(ctx.numa_node);
        if cpus.is_empty() {
            return;
        }
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for cpu in cpus {
                libc::CPU_SET(cpu, &mut set);
            }
            let rc = libc::sched_setaffinity(
                0,
                std::mem::size_of::<libc::cpu_set_t>(),
                &set,
            );
            if rc != 0 {
                warn!(
                    stream_id = ctx.stream_id,
                    numa_node = ctx.numa_node,
                    "failed to bind stream thread to NUMA node; continuing unbound"
                );
            }
        }
    }

    #[cfg(not(unix))]
    fn bind_to_node(&self, ctx: &StreamContext) {
        debug!(
            stream_id = ctx.stream_id,
            "NUMA-mask binding unsupported on this platform"
        );
    }
}

impl WorkerObserver for CoreBindingObserver {
    fn on_attach(&self, ctx: &StreamContext) {
        match self.binding {
            ThreadBindingPolicy::None => {}
            ThreadBindingPolicy::Cores | ThreadBindingPolicy::HybridAware => {
                self.pin_to_core(ctx)
            }
            ThreadBindingPolicy::NumaNode => self.bind_to_node(ctx),
        }
    }

    fn on_detach(&self, _ctx: &StreamContext) {}
}
