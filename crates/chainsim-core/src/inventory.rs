use crate::definition::ItemDef;
use crate::fixed::{Fixed64, Quantity};
use crate::id::ItemId;
use crate::units::UnitConverter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InventoryError {
    #[error("cannot convert {item} from {from} to {to}")]
    Conversion { item: ItemId, from: String, to: String },
    #[error("insufficient {item}: need {needed} {unit}, have {available}")]
    Insufficient {
        item: ItemId,
        needed: Quantity,
        available: Quantity,
        unit: String,
    },
    #[error("{item} quantity overflows")]
    Overflow { item: ItemId },
}

/// Held quantity of one item, in the unit it was first stocked in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub quantity: Quantity,
    pub unit: String,
}

/// Item stock keyed by item id.
///
/// Every add and take converts into the entry's held unit; a failed
/// conversion is an error, never a silent zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    entries: BTreeMap<ItemId, InventoryEntry>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, item: &ItemId) -> Option<&InventoryEntry> {
        self.entries.get(item)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ItemId, &InventoryEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Quantity of `item` expressed in `unit`. Zero if not held.
    pub fn available(
        &self,
        item: &ItemId,
        unit: &str,
        units: &dyn UnitConverter,
        def: Option<&ItemDef>,
    ) -> Result<Quantity, InventoryError> {
        match self.entries.get(item) {
            None => Ok(Fixed64::ZERO),
            Some(entry) => units
                .convert(entry.quantity, &entry.unit, unit, def)
                .ok_or_else(|| InventoryError::Conversion {
                    item: item.clone(),
                    from: entry.unit.clone(),
                    to: unit.to_string(),
                }),
        }
    }

    /// Add `qty` of `item` given in `unit`. A new entry keeps `unit`.
    /// Returns the quantity added, in the held unit.
    pub fn add(
        &mut self,
        item: &ItemId,
        qty: Quantity,
        unit: &str,
        units: &dyn UnitConverter,
        def: Option<&ItemDef>,
    ) -> Result<Quantity, InventoryError> {
        let Some(entry) = self.entries.get_mut(item) else {
            self.entries.insert(
                item.clone(),
                InventoryEntry { quantity: qty, unit: unit.to_string() },
            );
            return Ok(qty);
        };
        let converted = units
            .convert(qty, unit, &entry.unit, def)
            .ok_or_else(|| InventoryError::Conversion {
                item: item.clone(),
                from: unit.to_string(),
                to: entry.unit.clone(),
            })?;
        entry.quantity = entry
            .quantity
            .checked_add(converted)
            .ok_or_else(|| InventoryError::Overflow { item: item.clone() })?;
        Ok(converted)
    }

    /// Remove `qty` of `item` given in `unit`, all or nothing.
    pub fn take(
        &mut self,
        item: &ItemId,
        qty: Quantity,
        unit: &str,
        units: &dyn UnitConverter,
        def: Option<&ItemDef>,
    ) -> Result<(), InventoryError> {
        let insufficient = |available| InventoryError::Insufficient {
            item: item.clone(),
            needed: qty,
            available,
            unit: unit.to_string(),
        };
        let Some(entry) = self.entries.get_mut(item) else {
            return Err(insufficient(Fixed64::ZERO));
        };
        let converted = units
            .convert(qty, unit, &entry.unit, def)
            .ok_or_else(|| InventoryError::Conversion {
                item: item.clone(),
                from: unit.to_string(),
                to: entry.unit.clone(),
            })?;
        if converted > entry.quantity {
            let have = units
                .convert(entry.quantity, &entry.unit, unit, def)
                .unwrap_or(Fixed64::ZERO);
            return Err(insufficient(have));
        }
        entry.quantity -= converted;
        Ok(())
    }

    /// Overwrite an entry. Used when restoring persisted state.
    pub fn set(&mut self, item: ItemId, entry: InventoryEntry) {
        self.entries.insert(item, entry);
    }
}
