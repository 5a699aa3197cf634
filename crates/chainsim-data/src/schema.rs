//! Serde data file structs for production definitions.
//!
//! These structs define the on-disk format for items, processes, recipes and
//! machine bills of materials. They are deserialized from RON, JSON, or TOML
//! data files and then resolved into kernel types by the loader. Numbers are
//! plain `f64` here; the loader converts them to fixed point once.

use serde::Deserialize;

// ===========================================================================
// Items
// ===========================================================================

/// An item definition in a data file.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemData {
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ItemKindData,
    pub unit: String,
    #[serde(default)]
    pub material_class: Option<String>,
    #[serde(default)]
    pub mass_kg_per_unit: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKindData {
    RawMaterial,
    Material,
    Part,
    Product,
    Machine,
}

// ===========================================================================
// Flows
// ===========================================================================

/// A quantity of an item, in short tuple form or full form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FlowData {
    /// Short form: `("ore", 1.0, "kg")`.
    Short(String, f64, String),
    Full { item: String, qty: f64, unit: String },
}

impl FlowData {
    pub fn item(&self) -> &str {
        match self {
            FlowData::Short(item, _, _) | FlowData::Full { item, .. } => item,
        }
    }
}

// ===========================================================================
// Processes
// ===========================================================================

/// A process definition in a data file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessData {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: Vec<FlowData>,
    #[serde(default)]
    pub outputs: Vec<FlowData>,
    #[serde(default)]
    pub duration: DurationData,
    #[serde(default)]
    pub energy: EnergyData,
    #[serde(default)]
    pub machines: Vec<MachineData>,
}

/// Duration formula of a process.
#[derive(Debug, Clone, Default, Deserialize)]
pub enum DurationData {
    #[default]
    Unspecified,
    Fixed {
        hours: f64,
    },
    Batch {
        hr_per_batch: f64,
    },
    Rate {
        rate: f64,
        rate_unit: String,
        basis: String,
    },
}

/// Energy formula of a process.
#[derive(Debug, Clone, Default, Deserialize)]
pub enum EnergyData {
    #[default]
    None,
    Fixed {
        kwh: f64,
    },
    PerBatch {
        kwh: f64,
    },
    PerUnit {
        kwh_per_unit: f64,
        unit: String,
        basis: String,
    },
}

/// A machine hold required by a process.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineData {
    pub machine: String,
    #[serde(default = "default_machine_qty")]
    pub qty: f64,
    #[serde(default = "default_machine_unit")]
    pub unit: String,
}

fn default_machine_qty() -> f64 {
    1.0
}

fn default_machine_unit() -> String {
    "count".to_string()
}

// ===========================================================================
// Recipes
// ===========================================================================

/// A recipe definition in a data file.
#[derive(Debug, Clone, Deserialize)]
pub struct RecipeData {
    pub id: String,
    pub target_item: String,
    pub steps: Vec<StepData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepData {
    pub process: String,
    #[serde(default)]
    pub dependencies: Vec<usize>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub duration_hours: Option<f64>,
}

// ===========================================================================
// Bills of materials
// ===========================================================================

/// Components consumed to build one unit of a machine.
#[derive(Debug, Clone, Deserialize)]
pub struct BomData {
    pub machine: String,
    pub components: Vec<FlowData>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_data_from_ron() {
        let ron = r#"
            (
                id: "iron_ore",
                kind: raw_material,
                unit: "kg",
                material_class: Some("ore"),
            )
        "#;
        let item: ItemData = ron::from_str(ron).unwrap();
        assert_eq!(item.id, "iron_ore");
        assert_eq!(item.kind, ItemKindData::RawMaterial);
        assert_eq!(item.material_class.as_deref(), Some("ore"));
        assert!(item.name.is_none());
        assert!(item.mass_kg_per_unit.is_none());
    }

    #[test]
    fn process_data_from_ron() {
        let ron = r#"
            (
                id: "smelt",
                inputs: [("ore", 1.0, "kg")],
                outputs: [(item: "iron", qty: 0.5, unit: "kg")],
                duration: Batch(hr_per_batch: 2.0),
                energy: PerBatch(kwh: 3.0),
                machines: [(machine: "furnace")],
            )
        "#;
        let process: ProcessData = ron::from_str(ron).unwrap();
        assert_eq!(process.inputs[0].item(), "ore");
        assert!(matches!(process.outputs[0], FlowData::Full { .. }));
        assert!(matches!(process.duration, DurationData::Batch { .. }));
        assert!(matches!(process.energy, EnergyData::PerBatch { .. }));
        assert_eq!(process.machines[0].qty, 1.0);
        assert_eq!(process.machines[0].unit, "count");
    }

    #[test]
    fn process_data_defaults() {
        let process: ProcessData = ron::from_str(r#"(id: "idle")"#).unwrap();
        assert!(process.inputs.is_empty());
        assert!(matches!(process.duration, DurationData::Unspecified));
        assert!(matches!(process.energy, EnergyData::None));
        assert!(process.machines.is_empty());
    }

    #[test]
    fn process_data_from_json() {
        let json = r#"{
            "id": "cast",
            "inputs": [{"item": "iron", "qty": 0.5, "unit": "kg"}],
            "outputs": [["plate", 1.0, "count"]],
            "duration": {"Fixed": {"hours": 2.0}},
            "machines": [{"machine": "press", "qty": 1.0, "unit": "hr"}]
        }"#;
        let process: ProcessData = serde_json::from_str(json).unwrap();
        assert!(matches!(process.duration, DurationData::Fixed { hours } if hours == 2.0));
        assert!(matches!(&process.outputs[0], FlowData::Short(item, _, _) if item == "plate"));
        assert_eq!(process.machines[0].unit, "hr");
    }

    #[test]
    fn recipe_data_from_toml() {
        let toml = r#"
            id = "plate_line"
            target_item = "plate"

            [[steps]]
            process = "smelt"

            [[steps]]
            process = "cast"
            dependencies = [0]
            duration_hours = 1.5
        "#;
        let recipe: RecipeData = toml::from_str(toml).unwrap();
        assert_eq!(recipe.steps.len(), 2);
        assert!(recipe.steps[0].dependencies.is_empty());
        assert_eq!(recipe.steps[1].dependencies, vec![0]);
        assert_eq!(recipe.steps[1].duration_hours, Some(1.5));
    }

    #[test]
    fn bom_data_from_ron() {
        let ron = r#"(machine: "furnace", components: [("iron", 5.0, "kg")])"#;
        let bom: BomData = ron::from_str(ron).unwrap();
        assert_eq!(bom.machine, "furnace");
        assert_eq!(bom.components[0].item(), "iron");
    }
}
