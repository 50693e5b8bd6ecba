//! Fuzz target for the string config surface.
//!
//! Tests that arbitrary key/value pairs cannot cause panics and that a
//! rejected pair leaves the configuration unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use infermux::CoreConfig;

fuzz_target!(|pair: (&str, &str)| {
    let (key, value) = pair;
    let mut config = CoreConfig::default();
    let before = config.callback_streams.clone();
    if config.set(key, value).is_err() {
        assert_eq!(config.callback_streams.streams, before.streams);
        assert_eq!(
            config.callback_streams.threads_per_stream,
            before.threads_per_stream
        );
    }
    let _ = config.get(key);
});
