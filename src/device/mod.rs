//! Device collaborator contract.
//!
//! The core never inspects graph content. A compiled program is opaque: it
//! can create request handles, report its optimal concurrent-request count,
//! and start a request asynchronously with a completion callback.

mod info;

pub use info::{parse_device_priorities, DeviceInfo};

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// Completion status of one device request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Ok,
    Failed(String),
}

impl RequestStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Invoked exactly once per started request, on the device's completion
/// context (an arbitrary thread).
pub type CompletionCallback = Box<dyn FnOnce(RequestStatus) + Send>;

/// One input or output buffer handed to a request.
///
/// `resident_on` tags data already living on a specific device; the
/// pipeline's affinity probe steers dispatch toward that device.
#[derive(Debug, Clone)]
pub struct BufferRef {
    pub name: String,
    pub data: Arc<[u8]>,
    pub resident_on: Option<String>,
}

impl BufferRef {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self { name: name.into(), data: data.into(), resident_on: None }
    }

    /// Tag the buffer as resident on `device`.
    pub fn resident_on(mut self, device: impl Into<String>) -> Self {
        self.resident_on = Some(device.into());
        self
    }
}

/// Buffers of one logical inference request.
#[derive(Debug, Clone, Default)]
pub struct RequestPayload {
    pub buffers: Vec<BufferRef>,
}

impl RequestPayload {
    pub fn new(buffers: Vec<BufferRef>) -> Self {
        Self { buffers }
    }

    /// First device any buffer is resident on, in buffer order.
    pub fn preferred_device(&self) -> Option<&str> {
        self.buffers.iter().find_map(|b| b.resident_on.as_deref())
    }
}

/// One reusable in-flight request handle owned by a device.
pub trait DeviceRequest: Send {
    /// Copy or alias the payload's buffers into this request.
    fn assign_payload(&mut self, payload: &RequestPayload) -> Result<()>;

    /// Start execution asynchronously. The callback must be invoked exactly
    /// once with the completion status, and must not be invoked before
    /// `start` returns.
    fn start(&mut self, done: CompletionCallback) -> Result<()>;

    /// Per-stage performance counters of the last completed run.
    fn performance_counters(&self) -> HashMap<String, u64> {
        HashMap::new()
    }
}

/// An opaque compiled program loaded onto one device.
pub trait CompiledProgram: Send + Sync {
    /// Name of the device this program is compiled for.
    fn device_name(&self) -> &str;

    /// Create a fresh request handle.
    fn create_request(&self) -> Result<Box<dyn DeviceRequest>>;

    /// Optimal number of concurrently in-flight requests. `None` means the
    /// device cannot answer; the scheduler treats that as a fatal missing
    /// capability at construction.
    fn optimal_request_count(&self) -> Option<usize>;
}
