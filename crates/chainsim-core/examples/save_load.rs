//! Save/load example: snapshot and log replay.
//!
//! Runs a recipe part way, saves to a directory store, then restores the
//! engine twice: once from the snapshot and once by replaying the log alone.
//! Both copies must match the original.
//!
//! Run with: `cargo run -p chainsim-core --features test-utils --example save_load`

use chainsim_core::config::EngineConfig;
use chainsim_core::engine::SimulationEngine;
use chainsim_core::id::*;
use chainsim_core::store::{DirStore, MemoryStore, SimStore};
use chainsim_core::test_utils::{fx, ready_engine, smelting_registry};
use std::sync::Arc;

fn main() {
    let mut engine = ready_engine("save_load");
    engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
    engine.advance_time(fx(2.5)).unwrap();

    let dir = std::env::temp_dir().join("chainsim_save_load_example");
    let mut store = DirStore::open(&dir).unwrap();
    engine.save(&mut store).unwrap();
    println!("saved to {}", store.root().display());

    let config = EngineConfig::with_sim_id("save_load");
    let restored = SimulationEngine::load(config.clone(), Arc::new(smelting_registry()), &store).unwrap();
    println!("snapshot restore: hash {:016x}", restored.state_hash());

    // Copy only the log into a fresh store to force a replay.
    let mut log_only = MemoryStore::new();
    log_only
        .append_log("save_load", &store.read_log("save_load").unwrap())
        .unwrap();
    let replayed = SimulationEngine::load(config, Arc::new(smelting_registry()), &log_only).unwrap();
    println!("log replay:       hash {:016x}", replayed.state_hash());

    assert_eq!(engine.state_hash(), restored.state_hash());
    assert_eq!(engine.state_hash(), replayed.state_hash());
    println!("original:         hash {:016x}", engine.state_hash());

    let _ = std::fs::remove_dir_all(&dir);
}
