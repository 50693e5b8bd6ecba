//! Reusable per-device worker request slots and their idle pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{
    CompiledProgram, CompletionCallback, DeviceRequest, RequestPayload, RequestStatus,
};
use crate::error::Result;
use crate::queue::ThreadSafeQueue;

/// Continuation stored on a busy worker; invoked with the completion status.
pub type Continuation = Box<dyn FnOnce(RequestStatus) + Send>;

/// One reusable in-flight request slot for a device.
///
/// At most one pipeline holds a claim on a worker at a time; the busy flag
/// transitions only Idle→Busy on a successful claim and Busy→Idle on
/// completion or a failed hand-off.
pub struct WorkerRequest {
    device: String,
    request: Mutex<Box<dyn DeviceRequest>>,
    status: Mutex<RequestStatus>,
    continuation: Mutex<Option<Continuation>>,
    busy: AtomicBool,
}

impl WorkerRequest {
    fn new(device: String, request: Box<dyn DeviceRequest>) -> Self {
        Self {
            device,
            request: Mutex::new(request),
            status: Mutex::new(RequestStatus::Ok),
            continuation: Mutex::new(None),
            busy: AtomicBool::new(false),
        }
    }

    /// Device this worker belongs to.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn mark_busy(&self) {
        let was_busy = self.busy.swap(true, Ordering::AcqRel);
        debug_assert!(!was_busy, "claimed a worker that was already busy");
    }

    pub(crate) fn mark_idle(&self) {
        let was_busy = self.busy.swap(false, Ordering::AcqRel);
        debug_assert!(was_busy, "released a worker that was not busy");
    }

    /// Copy or alias the payload into the underlying device request.
    pub fn assign_payload(&self, payload: &RequestPayload) -> Result<()> {
        self.request.lock().assign_payload(payload)
    }

    /// Store the resumption to be invoked by the completion path.
    pub fn store_continuation(&self, continuation: Continuation) {
        let previous = self.continuation.lock().replace(continuation);
        debug_assert!(previous.is_none(), "continuation overwritten while in flight");
    }

    pub(crate) fn take_continuation(&self) -> Option<Continuation> {
        self.continuation.lock().take()
    }

    /// Start the device request asynchronously.
    pub fn start(&self, done: CompletionCallback) -> Result<()> {
        self.request.lock().start(done)
    }

    pub(crate) fn set_status(&self, status: RequestStatus) {
        *self.status.lock() = status;
    }

    /// Status recorded by the last completion.
    pub fn status(&self) -> RequestStatus {
        self.status.lock().clone()
    }

    /// Performance counters of the last completed run.
    pub fn performance_counters(&self) -> HashMap<String, u64> {
        self.request.lock().performance_counters()
    }
}

/// Fixed-size set of worker requests for one device, with a FIFO of idle
/// handles.
pub struct WorkerRequestPool {
    workers: Vec<Arc<WorkerRequest>>,
    idle: ThreadSafeQueue<Arc<WorkerRequest>>,
}

impl WorkerRequestPool {
    /// Create `size` request handles from the device's compiled program;
    /// all start idle.
    pub fn new(program: &dyn CompiledProgram, size: usize) -> Result<Self> {
        let device = program.device_name().to_string();
        let mut workers = Vec::with_capacity(size);
        let idle = ThreadSafeQueue::new();
        for _ in 0..size {
            let worker = Arc::new(WorkerRequest::new(device.clone(), program.create_request()?));
            idle.push(Arc::clone(&worker));
            workers.push(worker);
        }
        Ok(Self { workers, idle })
    }

    /// Non-blocking claim of an idle worker. The caller owns the Busy mark.
    pub fn try_claim(&self) -> Option<Arc<WorkerRequest>> {
        let worker = self.idle.try_pop()?;
        worker.mark_busy();
        Some(worker)
    }

    /// Return a worker to the idle FIFO.
    pub fn release(&self, worker: Arc<WorkerRequest>) {
        worker.mark_idle();
        self.idle.push(worker);
    }

    /// Fixed pool size.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Workers currently in the idle queue.
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Workers currently claimed.
    pub fn busy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy()).count()
    }
}

/// Scoped claim on a worker: returns it to the pool on drop unless
/// released for hand-off to a dispatched task.
pub struct IdleGuard<'a> {
    worker: Option<Arc<WorkerRequest>>,
    pool: &'a WorkerRequestPool,
}

impl<'a> IdleGuard<'a> {
    pub fn new(worker: Arc<WorkerRequest>, pool: &'a WorkerRequestPool) -> Self {
        Self { worker: Some(worker), pool }
    }

    /// Hand the worker off; it will not be auto-returned.
    pub fn release(mut self) -> Arc<WorkerRequest> {
        self.worker.take().expect("idle guard already released")
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }
}
