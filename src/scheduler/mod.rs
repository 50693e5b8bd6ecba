//! Multi-device scheduling: matching idle worker requests to pending
//! dispatch tasks in device-priority order.

mod worker_pool;

pub use worker_pool::{Continuation, IdleGuard, WorkerRequest, WorkerRequestPool};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::device::{CompiledProgram, CompletionCallback, DeviceInfo, RequestStatus};
use crate::error::{CoreError, Result};
use crate::queue::ThreadSafeQueue;
use crate::telemetry;

/// A dispatch task, invoked with the worker it was matched to. The claimed
/// worker travels with the invocation; there is no ambient current-worker
/// state.
pub type WorkerTask = Box<dyn FnOnce(Arc<WorkerRequest>) + Send + 'static>;

struct DeviceEntry {
    pool: WorkerRequestPool,
    pending: ThreadSafeQueue<WorkerTask>,
    /// Native optimal request count reported by the device.
    optimal: usize,
}

struct SchedulerState {
    devices: HashMap<String, DeviceEntry>,
    /// Current scan order; the only shared-lock resource, held for
    /// snapshot copies only.
    priorities: Mutex<Vec<DeviceInfo>>,
    global_pending: ThreadSafeQueue<WorkerTask>,
    terminate: AtomicBool,
}

/// Load-balances dispatch tasks across devices.
///
/// Owns one [`WorkerRequestPool`] and one pending-task queue per device,
/// plus a device-agnostic queue. The scan runs in declared priority order
/// and dispatches to the first device with both an idle worker and a
/// matching pending task.
pub struct DeviceScheduler {
    state: Arc<SchedulerState>,
}

impl std::fmt::Debug for DeviceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceScheduler").finish_non_exhaustive()
    }
}

impl DeviceScheduler {
    /// Build pools for every declared device.
    ///
    /// Every device must be backed by a compiled program that answers the
    /// optimal-request-count query; a missing program is `NotFound`, a
    /// missing capability is fatal `Capability`. No partial scheduler is
    /// ever created.
    pub fn new(
        programs: Vec<Arc<dyn CompiledProgram>>,
        declared: Vec<DeviceInfo>,
    ) -> Result<Self> {
        if declared.is_empty() {
            return Err(CoreError::Config("no devices declared".into()));
        }
        let by_name: HashMap<&str, &Arc<dyn CompiledProgram>> =
            programs.iter().map(|p| (p.device_name(), p)).collect();

        let mut devices = HashMap::new();
        for info in &declared {
            if devices.contains_key(&info.name) {
                return Err(CoreError::Config(format!(
                    "device '{}' declared twice",
                    info.name
                )));
            }
            let program = by_name.get(info.name.as_str()).ok_or_else(|| {
                CoreError::NotFound(format!(
                    "no compiled program for device '{}'",
                    info.name
                ))
            })?;
            let optimal = program.optimal_request_count().ok_or_else(|| {
                CoreError::Capability {
                    device: info.name.clone(),
                    capability: "optimal request count query".into(),
                }
            })?;
            let size = info
                .requested_concurrency
                .map(|n| n.get())
                .unwrap_or(optimal)
                .max(1);
            info!(device = %info.name, pool_size = size, optimal, "device pool created");
            devices.insert(
                info.name.clone(),
                DeviceEntry {
                    pool: WorkerRequestPool::new(program.as_ref(), size)?,
                    pending: ThreadSafeQueue::new(),
                    optimal,
                },
            );
        }

        Ok(Self {
            state: Arc::new(SchedulerState {
                devices,
                priorities: Mutex::new(declared),
                global_pending: ThreadSafeQueue::new(),
                terminate: AtomicBool::new(false),
            }),
        })
    }

    /// Accept a dispatch task and attempt scheduling immediately.
    ///
    /// With a preferred device the task goes to that device's pending
    /// queue, otherwise to the device-agnostic queue. After teardown has
    /// begun the task is dropped.
    pub fn dispatch(&self, preferred: Option<&str>, task: WorkerTask) -> Result<()> {
        if self.state.terminate.load(Ordering::Acquire) {
            debug!("dispatch after terminate; task dropped");
            return Ok(());
        }
        match preferred {
            Some(device) => {
                let entry = self.state.devices.get(device).ok_or_else(|| {
                    CoreError::NotFound(format!(
                        "preferred device '{device}' is not part of this scheduler"
                    ))
                })?;
                entry.pending.push(task);
                telemetry::record_pending_depth(device, entry.pending.len());
            }
            None => {
                self.state.global_pending.push(task);
                telemetry::record_pending_depth("any", self.state.global_pending.len());
            }
        }
        self.schedule();
        Ok(())
    }

    /// One scheduling pass: scan devices in priority order and perform at
    /// most one dispatch.
    ///
    /// A claimed worker that finds no pending task is auto-returned by its
    /// scope guard. Device-specific work takes precedence over the global
    /// queue on the device it targets.
    pub fn schedule(&self) {
        let snapshot = self.state.priorities.lock().clone();
        for info in snapshot {
            let Some(entry) = self.state.devices.get(&info.name) else { continue };
            let Some(worker) = entry.pool.try_claim() else { continue };
            let guard = IdleGuard::new(worker, &entry.pool);
            let task = entry
                .pending
                .try_pop()
                .or_else(|| self.state.global_pending.try_pop());
            if let Some(task) = task {
                let worker = guard.release();
                telemetry::record_dispatch(&info.name);
                task(worker);
                break;
            }
        }
    }

    /// Completion path, invoked from a device's callback on an arbitrary
    /// thread: record status, resume the stored continuation, return the
    /// worker to its idle pool and offer the freed capacity to pending
    /// work.
    pub fn complete(&self, worker: Arc<WorkerRequest>, status: RequestStatus) {
        worker.set_status(status.clone());
        telemetry::record_completion(worker.device(), status.is_ok());
        if let Some(continuation) = worker.take_continuation() {
            continuation(status);
        }
        if let Some(entry) = self.state.devices.get(worker.device()) {
            entry.pool.release(worker);
        }
        if !self.state.terminate.load(Ordering::Acquire) {
            self.schedule();
        }
    }

    /// Completion callback for [`WorkerRequest::start`], bound to one
    /// worker.
    pub fn completion_callback(
        self: &Arc<Self>,
        worker: Arc<WorkerRequest>,
    ) -> CompletionCallback {
        let scheduler = Arc::clone(self);
        Box::new(move |status| scheduler.complete(worker, status))
    }

    /// Replace the device scan order.
    ///
    /// Only devices known at construction may appear; an unknown name is
    /// `NotFound` and the prior list stays in effect. Request counts are
    /// fixed at construction: an override in the update is
    /// `NotImplemented`. Devices missing from the new list keep their
    /// pools; they are only excluded from future scans.
    pub fn set_device_priorities(&self, devices: Vec<DeviceInfo>) -> Result<()> {
        if devices.iter().any(|d| d.requested_concurrency.is_some()) {
            return Err(CoreError::NotImplemented(
                "device priorities can be changed at runtime, request counts cannot"
                    .into(),
            ));
        }
        for device in &devices {
            if !self.state.devices.contains_key(&device.name) {
                return Err(CoreError::NotFound(format!(
                    "device '{}' was not in the original device list",
                    device.name
                )));
            }
        }
        *self.state.priorities.lock() = devices;
        self.schedule();
        Ok(())
    }

    /// Current scan order.
    pub fn device_priorities(&self) -> Vec<DeviceInfo> {
        self.state.priorities.lock().clone()
    }

    /// Aggregate concurrency: sum of every device's native optimal request
    /// count.
    pub fn optimal_request_count(&self) -> usize {
        self.state.devices.values().map(|e| e.optimal).sum()
    }

    /// Names of all devices known at construction.
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.devices.keys().cloned().collect();
        names.sort();
        names
    }

    /// Fixed pool size of one device.
    pub fn pool_size(&self, device: &str) -> Option<usize> {
        self.state.devices.get(device).map(|e| e.pool.size())
    }

    /// Workers of one device currently in the idle queue.
    pub fn idle_workers(&self, device: &str) -> Option<usize> {
        self.state.devices.get(device).map(|e| e.pool.idle_count())
    }

    /// Workers of one device currently claimed.
    pub fn busy_workers(&self, device: &str) -> Option<usize> {
        self.state.devices.get(device).map(|e| e.pool.busy_count())
    }

    /// Depth of one device's pending queue.
    pub fn pending_tasks(&self, device: &str) -> Option<usize> {
        self.state.devices.get(device).map(|e| e.pending.len())
    }

    /// Depth of the device-agnostic queue.
    pub fn pending_global_tasks(&self) -> usize {
        self.state.global_pending.len()
    }

    /// Begin teardown: no new scheduling scan will find any device.
    /// In-flight completions still run; only re-scheduling is suppressed.
    pub fn shutdown(&self) {
        self.state.terminate.store(true, Ordering::Release);
        self.state.priorities.lock().clear();
        info!("device scheduler terminating");
    }

    pub fn is_terminating(&self) -> bool {
        self.state.terminate.load(Ordering::Acquire)
    }
}

impl Drop for DeviceScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
