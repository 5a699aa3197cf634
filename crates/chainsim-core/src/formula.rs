//! Duration and energy evaluation.
//!
//! Everything here is a pure function of a resolved [`ProcessDef`] and the
//! requested sizing. Nothing reads or writes simulation state.

use crate::definition::{DurationModel, EnergyModel, Flow, ProcessDef};
use crate::fixed::{Fixed64, Hours, Kwh, Quantity};
use crate::id::{ItemId, ProcessId};
use crate::registry::DefinitionStore;
use crate::units::UnitConverter;
use serde::{Deserialize, Serialize};

/// Errors from formula evaluation. Reported as `duration_calculation_failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormulaError {
    #[error("process {0} has no duration formula and no duration was supplied")]
    MissingDuration(ProcessId),
    #[error("process {process} has no flow for basis item {item}")]
    MissingBasis { process: ProcessId, item: ItemId },
    #[error("{what} must be positive")]
    NonPositive { what: &'static str },
    #[error("cannot convert {item} from {from} to {to}")]
    Conversion { item: ItemId, from: String, to: String },
    #[error("scale and output quantity are mutually exclusive")]
    ConflictingSizing,
    #[error("arithmetic overflow evaluating {0}")]
    Overflow(ProcessId),
}

/// A requested output amount, sized against the process's first output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTarget {
    pub qty: Quantity,
    pub unit: String,
}

/// How big a run should be. Any field left `None` is derived.
///
/// Scale defaults to 1 (or is derived from `output`); duration defaults to
/// the process's duration formula evaluated at that scale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sizing {
    pub scale: Option<Fixed64>,
    pub duration_hours: Option<Hours>,
    pub output: Option<OutputTarget>,
}

impl Sizing {
    pub fn scale(scale: Fixed64) -> Self {
        Self { scale: Some(scale), ..Self::default() }
    }

    pub fn duration(hours: Hours) -> Self {
        Self { duration_hours: Some(hours), ..Self::default() }
    }

    pub fn output(qty: Quantity, unit: impl Into<String>) -> Self {
        Self {
            output: Some(OutputTarget { qty, unit: unit.into() }),
            ..Self::default()
        }
    }

    pub fn with_duration(mut self, hours: Hours) -> Self {
        self.duration_hours = Some(hours);
        self
    }
}

/// A process instantiated at a concrete scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedRun {
    pub scale: Fixed64,
    pub duration_hours: Hours,
    pub inputs: Vec<Flow>,
    pub outputs: Vec<Flow>,
    pub energy_kwh: Kwh,
}

/// Size a process run: resolve scale, duration, flows and energy.
pub fn size_process(
    def: &ProcessDef,
    sizing: &Sizing,
    units: &dyn UnitConverter,
    store: &dyn DefinitionStore,
) -> Result<SizedRun, FormulaError> {
    let scale = resolve_scale(def, sizing, units, store)?;
    if scale <= Fixed64::ZERO {
        return Err(FormulaError::NonPositive { what: "scale" });
    }

    let duration_hours = match sizing.duration_hours {
        Some(h) if h <= Fixed64::ZERO => return Err(FormulaError::NonPositive { what: "duration" }),
        Some(h) => h,
        None => duration_for(def, scale, units, store)?,
    };

    let scaled = |flows: &[Flow]| -> Result<Vec<Flow>, FormulaError> {
        flows
            .iter()
            .map(|f| {
                let qty = f
                    .qty
                    .checked_mul(scale)
                    .ok_or_else(|| FormulaError::Overflow(def.id.clone()))?;
                Ok(Flow { item: f.item.clone(), qty, unit: f.unit.clone() })
            })
            .collect()
    };

    Ok(SizedRun {
        scale,
        duration_hours,
        inputs: scaled(def.inputs.as_slice())?,
        outputs: scaled(def.outputs.as_slice())?,
        energy_kwh: energy_for(def, scale, units, store)?,
    })
}

fn resolve_scale(
    def: &ProcessDef,
    sizing: &Sizing,
    units: &dyn UnitConverter,
    store: &dyn DefinitionStore,
) -> Result<Fixed64, FormulaError> {
    match (&sizing.scale, &sizing.output) {
        (Some(_), Some(_)) => Err(FormulaError::ConflictingSizing),
        (Some(s), None) => Ok(*s),
        (None, None) => Ok(Fixed64::ONE),
        (None, Some(target)) => {
            let primary = def.outputs.first().ok_or(FormulaError::NonPositive {
                what: "output count",
            })?;
            let wanted = convert(units, store, &primary.item, target.qty, &target.unit, &primary.unit)?;
            wanted
                .checked_div(primary.qty)
                .ok_or(FormulaError::NonPositive { what: "output quantity" })
        }
    }
}

/// Duration of one run at `scale`.
pub fn duration_for(
    def: &ProcessDef,
    scale: Fixed64,
    units: &dyn UnitConverter,
    store: &dyn DefinitionStore,
) -> Result<Hours, FormulaError> {
    let overflow = || FormulaError::Overflow(def.id.clone());
    let hours = match &def.duration {
        DurationModel::Unspecified => return Err(FormulaError::MissingDuration(def.id.clone())),
        DurationModel::Fixed { hours } => *hours,
        DurationModel::Batch { hr_per_batch } => hr_per_batch.checked_mul(scale).ok_or_else(overflow)?,
        DurationModel::Rate { rate, rate_unit, basis } => {
            if *rate <= Fixed64::ZERO {
                return Err(FormulaError::NonPositive { what: "rate" });
            }
            let qty = basis_quantity(def, basis, scale, rate_unit, units, store)?;
            qty.checked_div(*rate).ok_or_else(overflow)?
        }
    };
    if hours <= Fixed64::ZERO {
        return Err(FormulaError::NonPositive { what: "duration" });
    }
    Ok(hours)
}

/// Energy drawn by one run at `scale`.
pub fn energy_for(
    def: &ProcessDef,
    scale: Fixed64,
    units: &dyn UnitConverter,
    store: &dyn DefinitionStore,
) -> Result<Kwh, FormulaError> {
    let overflow = || FormulaError::Overflow(def.id.clone());
    match &def.energy {
        EnergyModel::None => Ok(Fixed64::ZERO),
        EnergyModel::Fixed { kwh } => Ok(*kwh),
        EnergyModel::PerBatch { kwh } => kwh.checked_mul(scale).ok_or_else(overflow),
        EnergyModel::PerUnit { kwh_per_unit, unit, basis } => {
            let qty = basis_quantity(def, basis, scale, unit, units, store)?;
            qty.checked_mul(*kwh_per_unit).ok_or_else(overflow)
        }
    }
}

/// Scaled quantity of the basis item's flow, expressed in `unit`.
fn basis_quantity(
    def: &ProcessDef,
    basis: &ItemId,
    scale: Fixed64,
    unit: &str,
    units: &dyn UnitConverter,
    store: &dyn DefinitionStore,
) -> Result<Quantity, FormulaError> {
    let flow = def.flow_of(basis).ok_or_else(|| FormulaError::MissingBasis {
        process: def.id.clone(),
        item: basis.clone(),
    })?;
    let qty = flow
        .qty
        .checked_mul(scale)
        .ok_or_else(|| FormulaError::Overflow(def.id.clone()))?;
    convert(units, store, basis, qty, &flow.unit, unit)
}

fn convert(
    units: &dyn UnitConverter,
    store: &dyn DefinitionStore,
    item: &ItemId,
    qty: Quantity,
    from: &str,
    to: &str,
) -> Result<Quantity, FormulaError> {
    units
        .convert(qty, from, to, store.get_item(item))
        .ok_or_else(|| FormulaError::Conversion {
            item: item.clone(),
            from: from.to_string(),
            to: to.to_string(),
        })
}
