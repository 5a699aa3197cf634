//! Cross-crate integration tests: a production plant defined in TOML data
//! files, loaded through chainsim-data and driven by the chainsim-core
//! engine.
//!
//! Set `RUST_LOG=chainsim_core=debug` to see the engine's event trace.

use chainsim_core::dependency::{DependencyGraph, GraphError};
use chainsim_core::engine::{ProcessRequest, SimulationEngine};
use chainsim_core::error::ErrorKind;
use chainsim_core::fixed::Fixed64;
use chainsim_core::formula::Sizing;
use chainsim_core::id::*;
use chainsim_core::registry::DefinitionStore;
use chainsim_core::store::DirStore;
use chainsim_core::test_utils::fx;
use chainsim_core::validation::diff_engines;
use chainsim_data::{load_production_data, ProductionData};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Fixture
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

const ENGINE_TOML: &str = r#"
sim_id = "data_plant"
allow_material_substitution = true
"#;

const ITEMS_TOML: &str = r#"
[[items]]
id = "ore"
kind = "raw_material"
unit = "kg"
material_class = "ore"

[[items]]
id = "iron"
kind = "material"
unit = "kg"

[[items]]
id = "sample"
kind = "material"
unit = "kg"

[[items]]
id = "plate"
kind = "part"
unit = "count"
mass_kg_per_unit = 0.5

[[items]]
id = "furnace"
kind = "machine"
unit = "count"

[[items]]
id = "press"
kind = "machine"
unit = "count"
"#;

const PROCESSES_TOML: &str = r#"
[[processes]]
id = "smelt"
name = "Smelt ore"
inputs = [{ item = "ore", qty = 1.0, unit = "kg" }]
outputs = [{ item = "iron", qty = 0.5, unit = "kg" }]
duration = { Batch = { hr_per_batch = 2.0 } }
energy = { PerBatch = { kwh = 3.0 } }
machines = [{ machine = "furnace" }]

[[processes]]
id = "cast"
inputs = [{ item = "iron", qty = 0.5, unit = "kg" }]
outputs = [{ item = "plate", qty = 1.0, unit = "count" }]
duration = { Fixed = { hours = 2.0 } }
machines = [{ machine = "press", qty = 1.0, unit = "hr" }]

[[processes]]
id = "assay"
inputs = [{ item = "ore", qty = 0.25, unit = "kg" }]
outputs = [{ item = "sample", qty = 0.25, unit = "kg" }]
"#;

const RECIPES_TOML: &str = r#"
[[recipes]]
id = "plate_line"
target_item = "plate"
steps = [
    { process = "smelt" },
    { process = "cast", dependencies = [0] },
]

[[recipes]]
id = "fan_out"
target_item = "sample"
steps = [
    { process = "smelt" },
    { process = "assay", dependencies = [0], duration_hours = 1.0 },
    { process = "assay", dependencies = [0], duration_hours = 1.0 },
]

[[recipes]]
id = "ring"
target_item = "plate"
steps = [
    { process = "smelt", dependencies = [2] },
    { process = "cast", dependencies = [0] },
    { process = "smelt", dependencies = [1] },
]
"#;

const BOMS_TOML: &str = r#"
[[boms]]
machine = "furnace"
components = [{ item = "iron", qty = 5.0, unit = "kg" }]
"#;

fn data_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("chainsim_plant_{name}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("engine.toml"), ENGINE_TOML).unwrap();
    fs::write(dir.join("items.toml"), ITEMS_TOML).unwrap();
    fs::write(dir.join("processes.toml"), PROCESSES_TOML).unwrap();
    fs::write(dir.join("recipes.toml"), RECIPES_TOML).unwrap();
    fs::write(dir.join("boms.toml"), BOMS_TOML).unwrap();
    dir
}

fn cleanup(dir: &Path) {
    let _ = fs::remove_dir_all(dir);
}

/// Loaded plant with 10 kg ore, one furnace and one press.
fn stocked_plant(dir: &Path) -> (ProductionData, SimulationEngine) {
    init_tracing();
    let data = load_production_data(dir).unwrap();
    let mut engine = SimulationEngine::new(data.config.clone(), Arc::new(data.registry.clone()));
    engine.import_item(&ItemId::new("ore"), fx(10.0), "kg").unwrap();
    engine.import_item(&ItemId::new("furnace"), fx(1.0), "count").unwrap();
    engine.import_item(&ItemId::new("press"), fx(1.0), "count").unwrap();
    (data, engine)
}

fn qty(engine: &SimulationEngine, item: &str) -> Fixed64 {
    engine
        .inventory_of(&ItemId::new(item))
        .map(|e| e.quantity)
        .unwrap_or(Fixed64::ZERO)
}

// ============================================================================
// Test 1: Data files load into a complete registry
// ============================================================================

#[test]
fn plant_files_load() {
    let dir = data_dir("load");
    let data = load_production_data(&dir).unwrap();

    assert_eq!(data.config.sim_id, "data_plant");
    assert_eq!(data.registry.item_count(), 6);
    assert_eq!(data.registry.process_count(), 3);
    assert_eq!(data.registry.recipe_count(), 3);
    assert_eq!(data.registry.bom_count(), 1);
    let plate = data.registry.get_item(&ItemId::new("plate")).unwrap();
    assert_eq!(plate.mass_kg_per_unit, Some(fx(0.5)));

    cleanup(&dir);
}

// ============================================================================
// Test 2: One batch leaves 9 kg of ore
// ============================================================================

#[test]
fn single_batch_consumes_one_kilogram() {
    let dir = data_dir("batch");
    let (_, mut engine) = stocked_plant(&dir);

    let run = engine
        .start_process(ProcessRequest::new(ProcessId::new("smelt")))
        .unwrap();
    let report = engine.advance_time(fx(2.0)).unwrap();

    assert_eq!(report.completed, vec![run]);
    assert_eq!(engine.active_processes().count(), 0);
    assert_eq!(qty(&engine, "ore"), fx(9.0));
    assert_eq!(qty(&engine, "iron"), fx(0.5));
    assert_eq!(engine.inventory_of(&ItemId::new("iron")).unwrap().unit, "kg");

    cleanup(&dir);
}

// ============================================================================
// Test 3: Furnace capacity 1 admits A and C but not B
// ============================================================================

#[test]
fn furnace_admits_only_non_overlapping_runs() {
    let dir = data_dir("contention");
    let (_, mut engine) = stocked_plant(&dir);
    let request = |at: f64| {
        ProcessRequest::new(ProcessId::new("smelt"))
            .with_sizing(Sizing::duration(fx(5.0)))
            .at(fx(at))
    };

    assert!(engine.start_process(request(0.0)).is_ok());
    let err = engine.start_process(request(2.0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MachineConflict);
    assert!(engine.start_process(request(5.0)).is_ok());

    let furnace = MachineId::new("furnace");
    assert_eq!(engine.utilization(&furnace, fx(0.0), fx(10.0)), Fixed64::ONE);

    cleanup(&dir);
}

// ============================================================================
// Test 4: Two-step recipe from data
// ============================================================================

#[test]
fn plate_line_recipe_progresses_by_step() {
    let dir = data_dir("plate_line");
    let (_, mut engine) = stocked_plant(&dir);
    let id = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();

    engine.advance_time(fx(2.0)).unwrap();
    let rr = engine.recipe_run(id).unwrap();
    assert_eq!(rr.completed_steps.iter().copied().collect::<Vec<_>>(), vec![0]);
    assert!(rr.active_steps.contains_key(&1) || rr.scheduled_steps.contains_key(&1));

    engine.advance_time(fx(2.0)).unwrap();
    assert!(engine.recipe_run(id).unwrap().is_completed);
    assert_eq!(qty(&engine, "plate"), fx(1.0));

    cleanup(&dir);
}

// ============================================================================
// Test 5: Fan-out depths and topological order
// ============================================================================

#[test]
fn fan_out_recipe_depths() {
    let dir = data_dir("fan_out");
    let (_, mut engine) = stocked_plant(&dir);
    let id = engine.run_recipe(&RecipeId::new("fan_out")).unwrap();

    let graph = &engine.recipe_run(id).unwrap().graph;
    assert_eq!(graph.depths(), &[0, 1, 1]);
    assert_eq!(graph.topological_order()[0], 0);

    let report = engine.advance_time(fx(3.0)).unwrap();
    assert_eq!(report.recipes_completed, vec![id]);
    assert_eq!(qty(&engine, "sample"), fx(0.5));
    assert_eq!(qty(&engine, "ore"), fx(8.5));

    cleanup(&dir);
}

// ============================================================================
// Test 6: A cyclic recipe is a construction error
// ============================================================================

#[test]
fn ring_recipe_is_rejected() {
    let dir = data_dir("ring");
    let (_, mut engine) = stocked_plant(&dir);

    assert!(matches!(
        DependencyGraph::new(vec![vec![2], vec![0], vec![1]]),
        Err(GraphError::Cycle(_))
    ));
    let err = engine.run_recipe(&RecipeId::new("ring")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(engine.recipe_runs().count(), 0);

    cleanup(&dir);
}

// ============================================================================
// Test 7: Save and load through both restore paths
// ============================================================================

#[test]
fn save_and_load_restore_inventory_time_and_active_runs() {
    let dir = data_dir("persist");
    let (data, mut engine) = stocked_plant(&dir);
    let defs: Arc<dyn DefinitionStore> = Arc::new(data.registry.clone());
    let mut store = DirStore::open(dir.join("store")).unwrap();

    engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
    engine.start_process(ProcessRequest::new(ProcessId::new("smelt")).at(fx(2.0))).unwrap();
    engine.advance_time(fx(3.0)).unwrap();
    engine.save(&mut store).unwrap();

    let from_snapshot = SimulationEngine::load(data.config.clone(), Arc::clone(&defs), &store).unwrap();
    fs::remove_file(dir.join("store").join("data_plant.snapshot")).unwrap();
    let from_log = SimulationEngine::load(data.config.clone(), Arc::clone(&defs), &store).unwrap();

    for restored in [&from_snapshot, &from_log] {
        assert_eq!(restored.current_time(), fx(3.0));
        assert_eq!(restored.state().inventory, engine.state().inventory);
        let active: Vec<_> = restored.active_processes().map(|r| r.process_run_id).collect();
        let expected: Vec<_> = engine.active_processes().map(|r| r.process_run_id).collect();
        assert_eq!(active, expected);
        assert!(diff_engines(&engine, restored).is_identical);
    }

    cleanup(&dir);
}
