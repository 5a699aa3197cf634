//! End-to-end tests for the chainsim kernel.
//!
//! Each test drives a full engine through its public API: imports, process
//! runs, recipes, machine builds, and persistence through a directory store.

use chainsim_core::config::EngineConfig;
use chainsim_core::engine::{ProcessRequest, SimulationEngine};
use chainsim_core::error::ErrorKind;
use chainsim_core::fixed::Fixed64;
use chainsim_core::formula::Sizing;
use chainsim_core::id::*;
use chainsim_core::journal::LogRecord;
use chainsim_core::store::{DirStore, SimStore};
use chainsim_core::test_utils::*;
use chainsim_core::validation::diff_engines;
use std::path::PathBuf;
use std::sync::Arc;

fn store_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("chainsim_it_{name}_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn smelt() -> ProcessRequest {
    ProcessRequest::new(ProcessId::new("smelt"))
}

fn qty(engine: &SimulationEngine, item: &str) -> Fixed64 {
    engine
        .inventory_of(&ItemId::new(item))
        .map(|e| e.quantity)
        .unwrap_or(Fixed64::ZERO)
}

// ===========================================================================
// Test 1: Plate line from raw ore to finished plate
// ===========================================================================

#[test]
fn plate_line_end_to_end() {
    let mut engine = ready_engine("plate_line");
    let recipe = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();

    let mut completed = Vec::new();
    for _ in 0..8 {
        let report = engine.advance_time(fx(0.5)).unwrap();
        completed.extend(report.recipes_completed);
    }

    assert_eq!(completed, vec![recipe]);
    assert_eq!(engine.current_time(), fx(4.0));
    assert_eq!(qty(&engine, "plate"), fx(1.0));
    assert_eq!(qty(&engine, "ore"), fx(9.0));
    assert_eq!(qty(&engine, "iron"), Fixed64::ZERO);
    assert_eq!(engine.state().total_energy_kwh, fx(4.0));
    assert_eq!(engine.completed_processes().len(), 2);
    assert!(engine.reservations().is_empty());
    assert_eq!(engine.pending_events().count(), 0);
}

// ===========================================================================
// Test 2: Batch run consumes exactly one batch of ore
// ===========================================================================

#[test]
fn ten_kilograms_of_ore_leave_nine() {
    let mut engine = ready_engine("ore");
    engine.start_process(smelt()).unwrap();
    engine.advance_time(fx(10.0)).unwrap();
    assert_eq!(qty(&engine, "ore"), fx(9.0));
    assert_eq!(qty(&engine, "iron"), fx(0.5));
}

// ===========================================================================
// Test 3: Furnace contention across three requests
// ===========================================================================

#[test]
fn back_to_back_runs_share_one_furnace() {
    let mut engine = ready_engine("abc");
    let five = Sizing::duration(fx(5.0));
    let a = engine.start_process(smelt().with_sizing(five.clone())).unwrap();
    let b = engine
        .start_process(smelt().with_sizing(five.clone()).at(fx(2.0)))
        .unwrap_err();
    let c = engine.start_process(smelt().with_sizing(five).at(fx(5.0))).unwrap();
    assert_eq!(b.kind(), ErrorKind::MachineConflict);

    let report = engine.advance_time(fx(5.0)).unwrap();
    assert_eq!(report.completed, vec![a]);
    assert_eq!(report.started, vec![a, c]);

    let report = engine.advance_time(fx(5.0)).unwrap();
    assert_eq!(report.completed, vec![c]);
    assert_eq!(qty(&engine, "ore"), fx(8.0));
}

// ===========================================================================
// Test 4: Smelted iron builds a second press
// ===========================================================================

#[test]
fn smelted_iron_builds_a_press() {
    let mut engine = ready_engine("build");
    let press = MachineId::new("press");
    engine
        .start_process(smelt().with_sizing(Sizing::scale(fx(4.0))))
        .unwrap();

    let err = engine.build_machine(&press, fx(1.0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientInputs);

    engine.advance_time(fx(8.0)).unwrap();
    assert_eq!(qty(&engine, "iron"), fx(2.0));
    engine.build_machine(&press, fx(1.0)).unwrap();
    assert_eq!(engine.state().machines_built_of(&press), fx(2.0));
    assert_eq!(qty(&engine, "iron"), Fixed64::ZERO);
}

// ===========================================================================
// Test 5: Cyclic recipe is refused
// ===========================================================================

#[test]
fn cyclic_recipe_leaves_engine_untouched() {
    let mut engine = ready_engine("cycle");
    let before = engine.state_hash();
    let err = engine.run_recipe(&RecipeId::new("loop")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert!(err.to_string().contains("cycle"));
    assert_eq!(engine.state_hash(), before);
    assert_eq!(engine.pending_events().count(), 0);
}

// ===========================================================================
// Test 6: Save, reload from snapshot, continue
// ===========================================================================

#[test]
fn snapshot_reload_continues_like_cold_run() {
    let dir = store_dir("snapshot");
    let mut store = DirStore::open(&dir).unwrap();

    let mut cold = ready_engine("persist");
    cold.run_recipe(&RecipeId::new("plate_line")).unwrap();
    cold.run_recipe(&RecipeId::new("plate_line")).unwrap();
    cold.advance_time(fx(3.0)).unwrap();

    let mut saved = ready_engine("persist");
    saved.run_recipe(&RecipeId::new("plate_line")).unwrap();
    saved.run_recipe(&RecipeId::new("plate_line")).unwrap();
    saved.advance_time(fx(3.0)).unwrap();
    saved.save(&mut store).unwrap();

    let mut loaded = SimulationEngine::load(
        EngineConfig::with_sim_id("persist"),
        Arc::new(smelting_registry()),
        &store,
    )
    .unwrap();
    assert!(diff_engines(&cold, &loaded).is_identical);

    cold.advance_time(fx(5.0)).unwrap();
    loaded.advance_time(fx(5.0)).unwrap();
    assert_eq!(cold.state_hash(), loaded.state_hash());
    assert_eq!(qty(&loaded, "plate"), fx(2.0));

    let _ = std::fs::remove_dir_all(&dir);
}

// ===========================================================================
// Test 7: Without a snapshot, the log alone rebuilds the engine
// ===========================================================================

#[test]
fn log_replay_matches_saved_engine() {
    let dir = store_dir("replay");
    let mut store = DirStore::open(&dir).unwrap();

    let mut engine = ready_engine("replayed");
    engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
    engine.advance_time(fx(1.0)).unwrap();
    engine.save(&mut store).unwrap();
    engine.advance_time(fx(1.5)).unwrap();
    engine.save(&mut store).unwrap();

    std::fs::remove_file(dir.join("replayed.snapshot")).unwrap();
    assert!(store.read_snapshot("replayed").unwrap().is_none());

    let log = store.read_log("replayed").unwrap();
    assert_eq!(
        log.iter()
            .filter(|r| matches!(r, LogRecord::StateSnapshot { .. }))
            .count(),
        2
    );

    let rebuilt = SimulationEngine::load(
        EngineConfig::with_sim_id("replayed"),
        Arc::new(smelting_registry()),
        &store,
    )
    .unwrap();
    let diff = diff_engines(&engine, &rebuilt);
    assert!(diff.is_identical, "{diff:?}");
    assert_eq!(rebuilt.current_time(), fx(2.5));
    assert_eq!(rebuilt.journal().flushed(), log.len());

    let _ = std::fs::remove_dir_all(&dir);
}

// ===========================================================================
// Test 8: Repeated saves append only new records
// ===========================================================================

#[test]
fn saves_append_incrementally() {
    let dir = store_dir("append");
    let mut store = DirStore::open(&dir).unwrap();

    let mut engine = ready_engine("append");
    engine.save(&mut store).unwrap();
    let first = store.read_log("append").unwrap().len();
    assert!(engine.journal().pending().is_empty());

    engine.start_process(smelt()).unwrap();
    engine.advance_time(fx(2.0)).unwrap();
    let new_records = engine.journal().pending().len();
    engine.save(&mut store).unwrap();

    assert_eq!(store.read_log("append").unwrap().len(), first + new_records);
    let _ = std::fs::remove_dir_all(&dir);
}
