//! Typed production definitions.
//!
//! These are the only shapes the kernel reads. Data files, however they are
//! written, are resolved into these types once at the store boundary.

use crate::fixed::{Fixed64, Hours, Kwh, Quantity};
use crate::id::{ItemId, MachineId, ProcessId, RecipeId};
use crate::units;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// Broad classification of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    RawMaterial,
    Material,
    Part,
    Product,
    Machine,
}

/// An item definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDef {
    pub id: ItemId,
    pub name: String,
    pub kind: ItemKind,
    /// Unit the item is normally counted in.
    pub unit: String,
    /// Items sharing a material class may stand in for each other as inputs.
    #[serde(default)]
    pub material_class: Option<String>,
    /// Mass of one counted unit, enabling count <-> mass conversion.
    #[serde(default)]
    pub mass_kg_per_unit: Option<Fixed64>,
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

/// A quantity of an item in a declared unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub item: ItemId,
    pub qty: Quantity,
    pub unit: String,
}

impl Flow {
    pub fn new(item: impl Into<String>, qty: Quantity, unit: impl Into<String>) -> Self {
        Self {
            item: ItemId::new(item),
            qty,
            unit: unit.into(),
        }
    }
}

/// A machine a process needs while it runs.
///
/// `unit` is `count`/`unit` for a hold over the whole run, or `hr` for a
/// hold of `qty` hours from the run's start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRequirement {
    pub machine: MachineId,
    pub qty: Quantity,
    pub unit: String,
}

/// How long one run of a process takes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationModel {
    /// No formula; callers must supply the duration.
    Unspecified,
    /// Constant duration regardless of scale.
    Fixed { hours: Hours },
    /// `hr_per_batch` hours per unit of scale.
    Batch { hr_per_batch: Hours },
    /// `rate` of `basis` item (in `rate_unit`) processed per hour.
    Rate {
        rate: Quantity,
        rate_unit: String,
        basis: ItemId,
    },
}

/// Energy drawn by one run of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnergyModel {
    None,
    /// Constant energy regardless of scale.
    Fixed { kwh: Kwh },
    /// `kwh` per unit of scale.
    PerBatch { kwh: Kwh },
    /// `kwh_per_unit` per `unit` of `basis` item handled.
    PerUnit {
        kwh_per_unit: Kwh,
        unit: String,
        basis: ItemId,
    },
}

/// A reusable production operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDef {
    pub id: ProcessId,
    pub name: String,
    pub inputs: Vec<Flow>,
    pub outputs: Vec<Flow>,
    pub duration: DurationModel,
    pub energy: EnergyModel,
    #[serde(default)]
    pub machines: Vec<MachineRequirement>,
}

/// A broken static rule, reported inside `validation_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule: String,
    pub message: String,
}

impl RuleViolation {
    pub fn new(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

impl ProcessDef {
    /// Check the static rules a process must satisfy before it may run.
    pub fn validate(&self) -> Vec<RuleViolation> {
        let mut violations = Vec::new();

        for (side, flows) in [("input", &self.inputs), ("output", &self.outputs)] {
            let mut seen = std::collections::BTreeSet::new();
            for flow in flows.iter() {
                if flow.qty <= Fixed64::ZERO {
                    violations.push(RuleViolation::new(
                        "positive_quantity",
                        format!("{side} {} has non-positive quantity {}", flow.item, flow.qty),
                    ));
                }
                if units::unit_factor(&flow.unit).is_none() {
                    violations.push(RuleViolation::new(
                        "known_unit",
                        format!("{side} {} uses unknown unit '{}'", flow.item, flow.unit),
                    ));
                }
                if !seen.insert(&flow.item) {
                    violations.push(RuleViolation::new(
                        "no_duplicate_flow",
                        format!("{side} {} is declared more than once", flow.item),
                    ));
                }
            }
        }

        if self.outputs.is_empty() {
            violations.push(RuleViolation::new(
                "has_outputs",
                format!("process {} declares no outputs", self.id),
            ));
        }

        let mut machines_seen = std::collections::BTreeSet::new();
        for req in &self.machines {
            if !machines_seen.insert(&req.machine) {
                violations.push(RuleViolation::new(
                    "no_duplicate_machine",
                    format!("machine {} is required more than once", req.machine),
                ));
            }
            if req.qty <= Fixed64::ZERO {
                violations.push(RuleViolation::new(
                    "positive_quantity",
                    format!("machine {} has non-positive quantity", req.machine),
                ));
            }
            if !units::is_count_unit(&req.unit) && !units::is_time_unit(&req.unit) {
                violations.push(RuleViolation::new(
                    "machine_unit",
                    format!(
                        "machine {} must be held in count/unit or hr, not '{}'",
                        req.machine, req.unit
                    ),
                ));
            }
        }

        match &self.duration {
            DurationModel::Fixed { hours } if *hours <= Fixed64::ZERO => {
                violations.push(RuleViolation::new("positive_duration", "fixed duration must be positive"));
            }
            DurationModel::Batch { hr_per_batch } if *hr_per_batch <= Fixed64::ZERO => {
                violations.push(RuleViolation::new("positive_duration", "hr_per_batch must be positive"));
            }
            DurationModel::Rate { rate, basis, .. } => {
                if *rate <= Fixed64::ZERO {
                    violations.push(RuleViolation::new("positive_rate", "rate must be positive"));
                }
                if self.flow_of(basis).is_none() {
                    violations.push(RuleViolation::new(
                        "rate_basis_declared",
                        format!("rate basis {basis} is neither an input nor an output"),
                    ));
                }
            }
            _ => {}
        }

        violations
    }

    /// The input or output flow for an item, inputs first.
    pub fn flow_of(&self, item: &ItemId) -> Option<&Flow> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|f| &f.item == item)
    }
}

// ---------------------------------------------------------------------------
// Recipes and BOMs
// ---------------------------------------------------------------------------

/// One step of a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeStep {
    pub process: ProcessId,
    /// Indices of steps that must complete first. Empty means ready at once.
    #[serde(default)]
    pub dependencies: Vec<usize>,
    /// Scale override for this step.
    #[serde(default)]
    pub scale: Option<Fixed64>,
    /// Duration override for this step.
    #[serde(default)]
    pub duration_hours: Option<Hours>,
}

/// A multi-step recipe producing a target item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeDef {
    pub id: RecipeId,
    pub target_item: ItemId,
    pub steps: Vec<RecipeStep>,
}

/// A flat component list to build one unit of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BomDef {
    pub machine: MachineId,
    pub components: Vec<Flow>,
}
