#![no_main]
use chainsim_core::engine::SimulationEngine;
use chainsim_core::test_utils::smelting_registry;
use chainsim_core::units::StandardUnits;
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes to the snapshot decoder.
    // Must not panic -- returning Err is fine.
    let _ = SimulationEngine::from_snapshot_bytes(data, Arc::new(smelting_registry()), Arc::new(StandardUnits));
});
