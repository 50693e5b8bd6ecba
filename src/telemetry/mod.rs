//! Telemetry for the execution core.
//!
//! Structured logging via `tracing` and counters/gauges via the `metrics`
//! facade. Nothing here talks to the network; recorders are the embedding
//! application's concern.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    record_completion, record_dispatch, record_pending_depth, record_task_enqueued,
};
