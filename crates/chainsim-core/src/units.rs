//! Unit conversion at the engine boundary.
//!
//! The engine never assumes a unit: every quantity travels with the unit it
//! was declared in, and conversion goes through a [`UnitConverter`]. A
//! conversion that cannot be performed returns `None`, which callers must
//! treat as a hard failure rather than as zero.

use crate::definition::ItemDef;
use crate::fixed::Fixed64;

/// Physical dimension of a unit. Conversions only happen within a dimension,
/// except count <-> mass, which goes through the item's unit mass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Mass,
    Volume,
    Count,
    Time,
    Energy,
}

/// Pure unit conversion function supplied to the engine.
pub trait UnitConverter: std::fmt::Debug {
    /// Convert `qty` from `from` to `to` for the given item. `item` is `None`
    /// when the definition store has no entry for it.
    fn convert(&self, qty: Fixed64, from: &str, to: &str, item: Option<&ItemDef>) -> Option<Fixed64>;
}

/// Built-in SI-ish unit table.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardUnits;

/// Exact ratio of a unit to its dimension's base unit (kg, L, count, hr,
/// kWh). Kept as a fraction so that `kg -> g` is exact in fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    pub num: i64,
    pub den: i64,
}

/// Resolve a unit name into its dimension and its ratio to the base unit.
pub fn unit_factor(unit: &str) -> Option<(Dimension, Ratio)> {
    let r = |num, den| Ratio { num, den };
    let entry = match unit.trim().to_ascii_lowercase().as_str() {
        "kg" => (Dimension::Mass, r(1, 1)),
        "g" => (Dimension::Mass, r(1, 1000)),
        "t" | "tonne" | "tonnes" => (Dimension::Mass, r(1000, 1)),
        "l" | "liter" | "litre" => (Dimension::Volume, r(1, 1)),
        "ml" => (Dimension::Volume, r(1, 1000)),
        "m3" => (Dimension::Volume, r(1000, 1)),
        "count" | "unit" | "units" | "each" | "ea" => (Dimension::Count, r(1, 1)),
        "hr" | "h" | "hour" | "hours" => (Dimension::Time, r(1, 1)),
        "min" => (Dimension::Time, r(1, 60)),
        "kwh" => (Dimension::Energy, r(1, 1)),
        "mwh" => (Dimension::Energy, r(1000, 1)),
        _ => return None,
    };
    Some(entry)
}

/// `qty` expressed in base units.
fn to_base(qty: Fixed64, r: Ratio) -> Option<Fixed64> {
    qty.checked_mul_int(r.num)?.checked_div_int(r.den)
}

/// `qty` in base units, expressed in the unit described by `r`.
fn from_base(qty: Fixed64, r: Ratio) -> Option<Fixed64> {
    qty.checked_mul_int(r.den)?.checked_div_int(r.num)
}

/// Whether a unit names a discrete count (machines are held in these).
pub fn is_count_unit(unit: &str) -> bool {
    matches!(unit_factor(unit), Some((Dimension::Count, _)))
}

/// Whether a unit names a span of time (used for partial machine holds).
pub fn is_time_unit(unit: &str) -> bool {
    matches!(unit_factor(unit), Some((Dimension::Time, _)))
}

impl UnitConverter for StandardUnits {
    fn convert(&self, qty: Fixed64, from: &str, to: &str, item: Option<&ItemDef>) -> Option<Fixed64> {
        if from.eq_ignore_ascii_case(to) {
            return Some(qty);
        }
        let (from_dim, from_ratio) = unit_factor(from)?;
        let (to_dim, to_ratio) = unit_factor(to)?;

        if from_dim == to_dim {
            if from_ratio == to_ratio {
                return Some(qty);
            }
            return from_base(to_base(qty, from_ratio)?, to_ratio);
        }

        // count <-> mass through the item's unit mass.
        let unit_mass = item.and_then(|i| i.mass_kg_per_unit)?;
        match (from_dim, to_dim) {
            (Dimension::Count, Dimension::Mass) => {
                let kg = to_base(qty, from_ratio)?.checked_mul(unit_mass)?;
                from_base(kg, to_ratio)
            }
            (Dimension::Mass, Dimension::Count) => {
                let kg = to_base(qty, from_ratio)?;
                from_base(kg.checked_div(unit_mass)?, to_ratio)
            }
            _ => None,
        }
    }
}
