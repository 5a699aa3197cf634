//! Simulation state owned by the engine, and the hash used to compare it.

use crate::fixed::{Fixed64, Hours, Kwh, Quantity};
use crate::id::MachineId;
use crate::inventory::Inventory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// Mutable simulation state. Only the engine writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationState {
    pub sim_id: String,
    pub current_time_hours: Hours,
    pub inventory: Inventory,
    /// Units of each machine built or imported. This is the capacity pushed
    /// into the reservation manager.
    pub machines_built: BTreeMap<MachineId, Quantity>,
    /// Units of each machine held by started, unreleased runs.
    pub machines_in_use: BTreeMap<MachineId, Quantity>,
    /// Running total of every import, per item.
    pub total_imports: Inventory,
    pub total_energy_kwh: Kwh,
}

impl SimulationState {
    pub fn new(sim_id: impl Into<String>, start: Hours) -> Self {
        Self {
            sim_id: sim_id.into(),
            current_time_hours: start,
            inventory: Inventory::new(),
            machines_built: BTreeMap::new(),
            machines_in_use: BTreeMap::new(),
            total_imports: Inventory::new(),
            total_energy_kwh: Fixed64::ZERO,
        }
    }

    pub fn machines_built_of(&self, machine: &MachineId) -> Quantity {
        self.machines_built.get(machine).copied().unwrap_or(Fixed64::ZERO)
    }

    pub fn machines_in_use_of(&self, machine: &MachineId) -> Quantity {
        self.machines_in_use.get(machine).copied().unwrap_or(Fixed64::ZERO)
    }

    pub(crate) fn adjust_in_use(&mut self, machine: &MachineId, delta: Quantity) {
        let entry = self.machines_in_use.entry(machine.clone()).or_insert(Fixed64::ZERO);
        *entry = (*entry + delta).max(Fixed64::ZERO);
    }

    /// Hash of every field, for cross-instance comparison.
    pub fn hash(&self) -> u64 {
        let mut h = StateHash::new();
        h.write(self.sim_id.as_bytes());
        h.write_fixed64(self.current_time_hours);
        for (item, entry) in self.inventory.iter() {
            h.write(item.as_str().as_bytes());
            h.write_fixed64(entry.quantity);
            h.write(entry.unit.as_bytes());
        }
        for map in [&self.machines_built, &self.machines_in_use] {
            h.write_u64(map.len() as u64);
            for (m, q) in map {
                h.write(m.as_str().as_bytes());
                h.write_fixed64(*q);
            }
        }
        for (item, entry) in self.total_imports.iter() {
            h.write(item.as_str().as_bytes());
            h.write_fixed64(entry.quantity);
        }
        h.write_fixed64(self.total_energy_kwh);
        h.finish()
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// Uses FNV-1a (64-bit) for speed and simplicity. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_fixed64(&mut self, v: Fixed64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    /// Hash any serializable value through its JSON form.
    pub fn write_json<T: Serialize>(&mut self, value: &T) {
        if let Ok(bytes) = serde_json::to_vec(value) {
            self.write(&bytes);
        }
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}
