//! The per-request pipeline: a fixed sequence of stages chained via
//! continuations, each stage bound to an executor.
//!
//! Stage 1 probes input buffers for device affinity, stage 2 dispatches
//! through the [`DeviceScheduler`], stage 3 starts asynchronous device
//! execution (the request's only suspension point: no thread is held while
//! the device runs), stage 4 finalizes on the callback executor.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::device::{RequestPayload, RequestStatus};
use crate::error::{CoreError, Result};
use crate::executor::TaskExecutor;
use crate::scheduler::{DeviceScheduler, WorkerRequest};

/// What a finished request reports back to its waiter.
#[derive(Debug, Clone)]
pub struct InferenceOutcome {
    /// Device that executed the request.
    pub device: String,
    /// Per-stage performance counters, populated when requested.
    pub performance_counters: HashMap<String, u64>,
}

/// Handle on an in-flight request. The caller may wait for the result or
/// detach; there is no mid-flight cancellation.
pub struct InferenceHandle {
    rx: oneshot::Receiver<Result<InferenceOutcome>>,
}

impl InferenceHandle {
    /// Block until the request finishes. A request abandoned by scheduler
    /// teardown before it was bound to a worker reports a device error.
    pub fn wait(self) -> Result<InferenceOutcome> {
        self.rx.blocking_recv().unwrap_or_else(|_| {
            Err(CoreError::Device {
                device: "<unassigned>".into(),
                reason: "request dropped before any device completed it".into(),
            })
        })
    }

    /// Abandon the result; the request still runs to completion if it was
    /// already bound to a worker.
    pub fn detach(self) {}
}

/// Builds and launches four-stage request pipelines over one scheduler.
pub struct RequestPipeline {
    scheduler: Arc<DeviceScheduler>,
    callback_executor: Arc<dyn TaskExecutor>,
    need_perf_counters: bool,
}

impl RequestPipeline {
    pub fn new(
        scheduler: Arc<DeviceScheduler>,
        callback_executor: Arc<dyn TaskExecutor>,
        need_perf_counters: bool,
    ) -> Self {
        Self { scheduler, callback_executor, need_perf_counters }
    }

    /// Submit one logical request. Never blocks on device availability:
    /// unmatched work waits in the scheduler's pending queues.
    pub fn submit(&self, payload: RequestPayload) -> InferenceHandle {
        let (tx, rx) = oneshot::channel();

        // Stage 1 (inline): affinity probe. The preferred device travels
        // as an explicit context value, not thread-local state.
        let preferred = payload.preferred_device().map(str::to_string);
        if let Some(device) = &preferred {
            debug!(device = %device, "request prefers resident device");
            if self.scheduler.pool_size(device).is_none() {
                let _ = tx.send(Err(CoreError::NotFound(format!(
                    "preferred device '{device}' is not part of this scheduler"
                ))));
                return InferenceHandle { rx };
            }
        }

        // Stage 2 (scheduler): bind payload to the matched worker, then
        // hand over to stage 3.
        let scheduler = Arc::clone(&self.scheduler);
        let callback_executor = Arc::clone(&self.callback_executor);
        let need_perf = self.need_perf_counters;
        let dispatch = Box::new(move |worker: Arc<WorkerRequest>| {
            if let Err(e) = worker.assign_payload(&payload) {
                let _ = tx.send(Err(e));
                scheduler.complete(
                    worker,
                    RequestStatus::Failed("payload assignment failed".into()),
                );
                return;
            }
            Self::start_stage(scheduler, callback_executor, need_perf, worker, tx);
        });

        if let Err(e) = self.scheduler.dispatch(preferred.as_deref(), dispatch) {
            // Unknown preferred devices were filtered above; any error here
            // is still reported to the waiter rather than swallowed.
            debug!(error = %e, "dispatch rejected");
        }
        InferenceHandle { rx }
    }

    /// Stage 3: store the stage-4 resumption as the worker's continuation
    /// and start asynchronous device execution.
    fn start_stage(
        scheduler: Arc<DeviceScheduler>,
        callback_executor: Arc<dyn TaskExecutor>,
        need_perf: bool,
        worker: Arc<WorkerRequest>,
        tx: oneshot::Sender<Result<InferenceOutcome>>,
    ) {
        let stage4_worker = Arc::clone(&worker);
        worker.store_continuation(Box::new(move |status: RequestStatus| {
            // Stage 4 (callback executor): inspect status, copy counters,
            // deliver to the waiter. Errors stay scoped to this request.
            let worker = stage4_worker;
            callback_executor.run(Box::new(move || {
                let result = match status {
                    RequestStatus::Ok => {
                        let performance_counters = if need_perf {
                            worker.performance_counters()
                        } else {
                            HashMap::new()
                        };
                        Ok(InferenceOutcome {
                            device: worker.device().to_string(),
                            performance_counters,
                        })
                    }
                    RequestStatus::Failed(reason) => Err(CoreError::Device {
                        device: worker.device().to_string(),
                        reason,
                    }),
                };
                let _ = tx.send(result);
            }));
        }));

        let done = scheduler.completion_callback(Arc::clone(&worker));
        if let Err(e) = worker.start(done) {
            // The device refused to start: resume stage 4 with the failure
            // and give the worker back.
            if let Some(continuation) = worker.take_continuation() {
                continuation(RequestStatus::Failed(e.to_string()));
            }
            scheduler.complete(worker, RequestStatus::Failed(e.to_string()));
        }
    }
}
