//! Metric recording helpers for executors and the device scheduler.
//!
//! All helpers are no-ops until the embedding application installs a
//! `metrics` recorder.

use metrics::{counter, gauge};

/// A task entered a stream executor's shared queue.
pub fn record_task_enqueued(executor: &str) {
    counter!("core_executor_tasks_enqueued_total", "executor" => executor.to_string())
        .increment(1);
}

/// The scheduler matched a pending task to an idle worker on `device`.
pub fn record_dispatch(device: &str) {
    counter!("core_scheduler_dispatches_total", "device" => device.to_string())
        .increment(1);
}

/// A device reported a request finished.
pub fn record_completion(device: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!(
        "core_scheduler_completions_total",
        "device" => device.to_string(),
        "outcome" => outcome,
    )
    .increment(1);
}

/// Depth of one pending-task queue after a push. The device-agnostic queue
/// reports under the label "any".
pub fn record_pending_depth(device: &str, depth: usize) {
    gauge!("core_scheduler_pending_tasks", "device" => device.to_string())
        .set(depth as f64);
}
