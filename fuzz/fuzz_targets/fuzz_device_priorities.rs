//! Fuzz target for device priority list parsing.
//!
//! Tests that arbitrary strings cannot cause panics when parsed as a
//! comma-separated device priority list.

#![no_main]

use libfuzzer_sys::fuzz_target;
use infermux::parse_device_priorities;

fuzz_target!(|data: &str| {
    // Parsing should never panic - only return Ok or Err.
    if let Ok(devices) = parse_device_priorities(data) {
        // Accepted lists contain no empty names and no zero counts.
        for device in devices {
            assert!(!device.name.is_empty());
            if let Some(n) = device.requested_concurrency {
                assert!(n.get() > 0);
            }
        }
    }
});
