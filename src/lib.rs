//! Concurrent execution substrate for multi-device inference.
//!
//! The crate schedules inference requests across a prioritized set of
//! compute devices, each backed by a fixed pool of reusable worker request
//! slots, and runs CPU-side work on affinity-aware stream executors.
//!
//! # Layers
//!
//! - [`topology`]: host CPU layout (NUMA nodes, hybrid core classes)
//! - [`executor`]: stream executors, thread binding, deferred inline mode
//! - [`scheduler`]: worker request pools and priority-ordered dispatch
//! - [`pipeline`]: the four-stage per-request pipeline
//!
//! Devices plug in behind two traits, [`CompiledProgram`] and
//! [`DeviceRequest`]; the core never talks to hardware directly.
//!
//! # Concurrency model
//!
//! No global state and no thread-local context: the current worker, the
//! completion status and the preferred device all travel as explicit values
//! through closures. Every cross-thread hand-off happens over a
//! [`ThreadSafeQueue`] or a claimed worker slot, and errors stay scoped to
//! the request that caused them.

pub mod device;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod telemetry;
pub mod topology;

use std::sync::Arc;

use tracing::info;

pub use device::{
    parse_device_priorities, BufferRef, CompiledProgram, CompletionCallback, DeviceInfo,
    DeviceRequest, RequestPayload, RequestStatus,
};
pub use error::{CoreError, Result};
pub use executor::{StreamConfig, StreamExecutor, TaskExecutor};
pub use pipeline::{InferenceHandle, InferenceOutcome, RequestPipeline};
pub use queue::ThreadSafeQueue;
pub use scheduler::DeviceScheduler;
pub use topology::CoreTopology;

/// Config key holding the comma-separated device priority list,
/// e.g. `"CPU(2),GPU"`.
pub const KEY_DEVICE_PRIORITIES: &str = "device-priorities";

/// Metric keys answerable through the query surface.
pub const METRIC_SUPPORTED_METRICS: &str = "supported-metrics";
pub const METRIC_SUPPORTED_CONFIG_KEYS: &str = "supported-config-keys";
pub const METRIC_OPTIMAL_REQUEST_COUNT: &str = "optimal-request-count";
pub const METRIC_DEVICE_NAMES: &str = "device-names";

/// Construction-time configuration of an [`ExecutionCore`].
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Stream executor running pipeline completion callbacks.
    /// `streams == 0` runs callbacks inline on the completing thread.
    pub callback_streams: StreamConfig,
    /// Devices in scan priority order.
    pub devices: Vec<DeviceInfo>,
    /// Collect per-stage performance counters on success.
    pub need_perf_counters: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            callback_streams: StreamConfig::named("callback"),
            devices: Vec::new(),
            need_perf_counters: false,
        }
    }
}

impl CoreConfig {
    /// Keys accepted by [`set`](Self::set).
    pub fn supported_keys() -> Vec<&'static str> {
        let mut keys = StreamConfig::supported_keys();
        keys.push(KEY_DEVICE_PRIORITIES);
        keys
    }

    /// Apply one string key/value pair. Unknown keys and malformed values
    /// are rejected and leave the configuration untouched.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if key == KEY_DEVICE_PRIORITIES {
            self.devices = parse_device_priorities(value)?;
            Ok(())
        } else {
            self.callback_streams.set(key, value)
        }
    }

    /// Read one key back as a string.
    pub fn get(&self, key: &str) -> Result<String> {
        if key == KEY_DEVICE_PRIORITIES {
            let rendered: Vec<String> = self
                .devices
                .iter()
                .map(|d| match d.requested_concurrency {
                    Some(n) => format!("{}({})", d.name, n),
                    None => d.name.clone(),
                })
                .collect();
            Ok(rendered.join(","))
        } else {
            self.callback_streams.get(key)
        }
    }
}

/// The assembled execution core: one scheduler over all devices, one
/// callback executor, and a pipeline factory for request submission.
pub struct ExecutionCore {
    scheduler: Arc<DeviceScheduler>,
    pipeline: RequestPipeline,
}

impl ExecutionCore {
    /// Build the core from compiled programs and a validated config.
    ///
    /// Fails fast: a device without a program, or a program that cannot
    /// answer the optimal-request-count query, aborts construction and no
    /// partial core is created.
    pub fn new(programs: Vec<Arc<dyn CompiledProgram>>, config: CoreConfig) -> Result<Self> {
        let scheduler = Arc::new(DeviceScheduler::new(programs, config.devices)?);
        let callbacks: Arc<dyn TaskExecutor> =
            Arc::new(StreamExecutor::new(config.callback_streams)?);
        let pipeline = RequestPipeline::new(
            Arc::clone(&scheduler),
            callbacks,
            config.need_perf_counters,
        );
        info!(
            devices = ?scheduler.device_names(),
            optimal_requests = scheduler.optimal_request_count(),
            "execution core ready"
        );
        Ok(Self { scheduler, pipeline })
    }

    /// Submit one request; returns immediately with a waitable handle.
    pub fn submit(&self, payload: RequestPayload) -> InferenceHandle {
        self.pipeline.submit(payload)
    }

    /// Change the device scan order at runtime.
    ///
    /// This is the only mutable config key. Known stream keys report
    /// `NotImplemented` after construction; anything else is `NotFound`.
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        if key == KEY_DEVICE_PRIORITIES {
            let devices = parse_device_priorities(value)?;
            return self.scheduler.set_device_priorities(devices);
        }
        if StreamConfig::supported_keys().contains(&key) {
            return Err(CoreError::NotImplemented(format!(
                "config key '{key}' is fixed at construction"
            )));
        }
        Err(CoreError::NotFound(format!("unknown config key '{key}'")))
    }

    /// Metric keys this core can answer. Each key names one of the query
    /// methods on this type.
    pub fn supported_metrics() -> Vec<&'static str> {
        vec![
            METRIC_SUPPORTED_METRICS,
            METRIC_SUPPORTED_CONFIG_KEYS,
            METRIC_OPTIMAL_REQUEST_COUNT,
            METRIC_DEVICE_NAMES,
        ]
    }

    /// Aggregate optimal concurrency: the sum of every device's native
    /// optimal request count.
    pub fn optimal_request_count(&self) -> usize {
        self.scheduler.optimal_request_count()
    }

    /// Current device scan order.
    pub fn device_priorities(&self) -> Vec<DeviceInfo> {
        self.scheduler.device_priorities()
    }

    /// All devices known to the core, sorted by name.
    pub fn device_names(&self) -> Vec<String> {
        self.scheduler.device_names()
    }

    /// The scheduler backing this core.
    pub fn scheduler(&self) -> &Arc<DeviceScheduler> {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_device_priorities() {
        let mut config = CoreConfig::default();
        config.set(KEY_DEVICE_PRIORITIES, "CPU(2),GPU").unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.get(KEY_DEVICE_PRIORITIES).unwrap(), "CPU(2),GPU");
    }

    #[test]
    fn config_rejects_unknown_keys() {
        let mut config = CoreConfig::default();
        assert!(config.set("device-list", "CPU").is_err());
        assert!(config.get("device-list").is_err());
    }

    #[test]
    fn config_exposes_stream_keys() {
        let mut config = CoreConfig::default();
        config.set(executor::KEY_STREAMS, "2").unwrap();
        assert_eq!(config.callback_streams.streams, 2);
        assert!(CoreConfig::supported_keys().contains(&KEY_DEVICE_PRIORITIES));
        assert!(CoreConfig::supported_keys().contains(&executor::KEY_STREAMS));
    }
}
