//! Error types for the execution substrate.
//!
//! Construction-time errors are fatal and synchronous. Per-request errors
//! are scoped to the single request's waiter and never affect the scheduler
//! or other in-flight requests.

use thiserror::Error;

/// Errors surfaced by the execution core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device '{device}' lacks required capability: {capability}")]
    Capability { device: String, capability: String },

    #[error("Device '{device}' failed: {reason}")]
    Device { device: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl CoreError {
    /// Returns true if this error is fatal at construction time.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Capability { .. })
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
