//! Device priority declarations and the priority-string parser.

use std::num::NonZeroUsize;

use crate::error::{CoreError, Result};

/// One device's position in the scheduling order, with an optional
/// per-device request-count override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    /// Overrides the device's reported optimal request count when set.
    pub requested_concurrency: Option<NonZeroUsize>,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), requested_concurrency: None }
    }

    pub fn with_concurrency(name: impl Into<String>, requests: usize) -> Result<Self> {
        let requests = NonZeroUsize::new(requests).ok_or_else(|| {
            CoreError::Config("requested concurrency must be a positive integer".into())
        })?;
        Ok(Self { name: name.into(), requested_concurrency: Some(requests) })
    }
}

/// Parse a comma-separated device priority string, left to right.
///
/// Each token is `deviceName` or `deviceName(requestedConcurrency)`, e.g.
/// `"CPU(2),GPU"`. The concurrency, when present, must be a positive
/// integer.
pub fn parse_device_priorities(priorities: &str) -> Result<Vec<DeviceInfo>> {
    if priorities.trim().is_empty() {
        return Err(CoreError::Config("device priority string is empty".into()));
    }
    priorities.split(',').map(parse_token).collect()
}

fn parse_token(token: &str) -> Result<DeviceInfo> {
    let token = token.trim();
    if token.is_empty() {
        return Err(CoreError::Config("empty device priority token".into()));
    }
    let Some(open) = token.find('(') else {
        return Ok(DeviceInfo::new(token));
    };
    let close = token.rfind(')').filter(|&c| c > open).ok_or_else(|| {
        CoreError::Config(format!("unbalanced parentheses in device token '{token}'"))
    })?;
    let name = token[..open].trim();
    if name.is_empty() || close != token.len() - 1 {
        return Err(CoreError::Config(format!("malformed device token '{token}'")));
    }
    let requests: usize = token[open + 1..close].trim().parse().map_err(|_| {
        CoreError::Config(format!(
            "request count in device token '{token}' must be a positive integer"
        ))
    })?;
    DeviceInfo::with_concurrency(name, requests)
}
