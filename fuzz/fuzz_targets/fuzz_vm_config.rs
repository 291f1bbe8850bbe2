//! Fuzz target: `VmConfig` deserialization and document rendering.
//!
//! Arbitrary JSON must never panic, and any rendered document must be
//! valid JSON.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vmrunner_core::VmConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(config) = serde_json::from_slice::<VmConfig>(data) else {
        return;
    };
    if let Ok(document) = config.to_document() {
        let parsed: Result<serde_json::Value, _> = serde_json::from_str(&document);
        assert!(parsed.is_ok(), "rendered document must be valid JSON");
    }
});
