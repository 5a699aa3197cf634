//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::config::EngineConfig;
use crate::definition::*;
use crate::engine::SimulationEngine;
use crate::fixed::Fixed64;
use crate::id::*;
use crate::registry::{Registry, RegistryBuilder};
use std::sync::Arc;

// ===========================================================================
// Fixed-point helper
// ===========================================================================

pub fn fx(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

// ===========================================================================
// Definition constructors
// ===========================================================================

pub fn item(id: &str, kind: ItemKind, unit: &str) -> ItemDef {
    ItemDef {
        id: ItemId::new(id),
        name: id.to_string(),
        kind,
        unit: unit.to_string(),
        material_class: None,
        mass_kg_per_unit: None,
    }
}

pub fn classed(mut def: ItemDef, class: &str) -> ItemDef {
    def.material_class = Some(class.to_string());
    def
}

pub fn machine(id: &str, qty: f64, unit: &str) -> MachineRequirement {
    MachineRequirement {
        machine: MachineId::new(id),
        qty: fx(qty),
        unit: unit.to_string(),
    }
}

pub fn step(process: &str, dependencies: &[usize]) -> RecipeStep {
    RecipeStep {
        process: ProcessId::new(process),
        dependencies: dependencies.to_vec(),
        scale: None,
        duration_hours: None,
    }
}

/// 1 kg ore -> 0.5 kg iron, 2 h and 3 kWh per batch, one furnace.
pub fn smelt_process() -> ProcessDef {
    ProcessDef {
        id: ProcessId::new("smelt"),
        name: "Smelt ore".into(),
        inputs: vec![Flow::new("ore", fx(1.0), "kg")],
        outputs: vec![Flow::new("iron", fx(0.5), "kg")],
        duration: DurationModel::Batch { hr_per_batch: fx(2.0) },
        energy: EnergyModel::PerBatch { kwh: fx(3.0) },
        machines: vec![machine("furnace", 1.0, "count")],
    }
}

/// 0.5 kg iron -> 1 plate over a fixed 2 h. Holds the press for the first hour only.
pub fn cast_process() -> ProcessDef {
    ProcessDef {
        id: ProcessId::new("cast"),
        name: "Cast plate".into(),
        inputs: vec![Flow::new("iron", fx(0.5), "kg")],
        outputs: vec![Flow::new("plate", fx(1.0), "count")],
        duration: DurationModel::Fixed { hours: fx(2.0) },
        energy: EnergyModel::Fixed { kwh: fx(1.0) },
        machines: vec![machine("press", 1.0, "hr")],
    }
}

/// No duration formula; callers must pass a duration.
pub fn assay_process() -> ProcessDef {
    ProcessDef {
        id: ProcessId::new("assay"),
        name: "Assay ore".into(),
        inputs: vec![Flow::new("ore", fx(0.25), "kg")],
        outputs: vec![Flow::new("sample", fx(0.25), "kg")],
        duration: DurationModel::Unspecified,
        energy: EnergyModel::None,
        machines: vec![],
    }
}

/// Items, processes, recipes and BOMs for a small ore -> plate chain.
///
/// - `plate_line`: smelt, then cast depending on it.
/// - `loop`: two steps depending on each other.
pub fn smelting_registry() -> Registry {
    let mut b = RegistryBuilder::new();
    b.register_item(classed(item("ore", ItemKind::RawMaterial, "kg"), "ore"))
        .register_item(classed(item("rich_ore", ItemKind::RawMaterial, "kg"), "ore"))
        .register_item(item("iron", ItemKind::Material, "kg"))
        .register_item(item("sample", ItemKind::Material, "kg"))
        .register_item(ItemDef {
            mass_kg_per_unit: Some(fx(0.5)),
            ..item("plate", ItemKind::Part, "count")
        })
        .register_item(item("furnace", ItemKind::Machine, "count"))
        .register_item(item("press", ItemKind::Machine, "count"));

    b.register_process(smelt_process())
        .register_process(cast_process())
        .register_process(assay_process());

    b.register_recipe(RecipeDef {
        id: RecipeId::new("plate_line"),
        target_item: ItemId::new("plate"),
        steps: vec![step("smelt", &[]), step("cast", &[0])],
    })
    .register_recipe(RecipeDef {
        id: RecipeId::new("loop"),
        target_item: ItemId::new("plate"),
        steps: vec![step("smelt", &[1]), step("cast", &[0])],
    });

    b.register_bom(BomDef {
        machine: MachineId::new("furnace"),
        components: vec![Flow::new("iron", fx(5.0), "kg")],
    })
    .register_bom(BomDef {
        machine: MachineId::new("press"),
        components: vec![Flow::new("iron", fx(2.0), "kg")],
    });

    b.build().expect("test registry should build")
}

// ===========================================================================
// Engine constructors
// ===========================================================================

/// An empty engine over [`smelting_registry`].
pub fn smelting_engine(sim_id: &str) -> SimulationEngine {
    SimulationEngine::new(EngineConfig::with_sim_id(sim_id), Arc::new(smelting_registry()))
}

/// 10 kg ore, one furnace and one press, at t = 0.
pub fn ready_engine(sim_id: &str) -> SimulationEngine {
    let mut engine = smelting_engine(sim_id);
    engine.import_item(&ItemId::new("ore"), fx(10.0), "kg").expect("import ore");
    engine.import_item(&ItemId::new("furnace"), fx(1.0), "count").expect("import furnace");
    engine.import_item(&ItemId::new("press"), fx(1.0), "count").expect("import press");
    engine
}
