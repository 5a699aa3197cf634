//! State comparison and determinism checking.
//!
//! Provides utilities for comparing two engines to find where they
//! diverge, and for checking that a simulation restored from the same
//! snapshot produces identical results when advanced the same way.

use crate::engine::SimulationEngine;
use crate::fixed::{Hours, Quantity};
use crate::id::{ItemId, MachineId, ProcessRunId};
use crate::registry::DefinitionStore;
use crate::serialize::DeserializeError;
use crate::units::UnitConverter;
use std::collections::BTreeSet;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// State diff types
// ---------------------------------------------------------------------------

/// Difference in one inventory line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryDiff {
    OnlyInA(ItemId),
    OnlyInB(ItemId),
    /// Held in both, in a different quantity or unit.
    Mismatch {
        item: ItemId,
        a: (Quantity, String),
        b: (Quantity, String),
    },
}

/// Difference in the set of active runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunDiff {
    OnlyInA(ProcessRunId),
    OnlyInB(ProcessRunId),
    StateMismatch { run: ProcessRunId, description: String },
}

/// Per-subsystem match results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsystemDiff {
    pub state_matches: bool,
    pub scheduler_matches: bool,
    pub reservations_match: bool,
    pub recipes_match: bool,
    pub counters_match: bool,
}

impl SubsystemDiff {
    pub fn all_match(&self) -> bool {
        self.state_matches
            && self.scheduler_matches
            && self.reservations_match
            && self.recipes_match
            && self.counters_match
    }
}

/// Full state diff between two engines.
#[derive(Debug, Clone)]
pub struct StateDiff {
    pub is_identical: bool,
    pub subsystem_diffs: SubsystemDiff,
    pub inventory_diffs: Vec<InventoryDiff>,
    pub run_diffs: Vec<RunDiff>,
    /// Machines whose built or in-use count differs.
    pub machine_diffs: Vec<MachineId>,
}

// ---------------------------------------------------------------------------
// Quick compare (subsystem-level only)
// ---------------------------------------------------------------------------

/// Quick subsystem-level comparison using hashes.
pub fn quick_compare(a: &SimulationEngine, b: &SimulationEngine) -> SubsystemDiff {
    let ha = a.subsystem_hashes();
    let hb = b.subsystem_hashes();

    SubsystemDiff {
        state_matches: ha.state == hb.state,
        scheduler_matches: ha.scheduler == hb.scheduler,
        reservations_match: ha.reservations == hb.reservations,
        recipes_match: ha.recipes == hb.recipes,
        counters_match: ha.counters == hb.counters,
    }
}

// ---------------------------------------------------------------------------
// Full diff
// ---------------------------------------------------------------------------

/// Compute a detailed diff between two engines.
pub fn diff_engines(a: &SimulationEngine, b: &SimulationEngine) -> StateDiff {
    let subsystem_diffs = quick_compare(a, b);
    let (sa, sb) = (a.state(), b.state());

    let mut inventory_diffs = Vec::new();
    for (item, ea) in sa.inventory.iter() {
        match sb.inventory.get(item) {
            None => inventory_diffs.push(InventoryDiff::OnlyInA(item.clone())),
            Some(eb) if eb != ea => inventory_diffs.push(InventoryDiff::Mismatch {
                item: item.clone(),
                a: (ea.quantity, ea.unit.clone()),
                b: (eb.quantity, eb.unit.clone()),
            }),
            Some(_) => {}
        }
    }
    for (item, _) in sb.inventory.iter() {
        if sa.inventory.get(item).is_none() {
            inventory_diffs.push(InventoryDiff::OnlyInB(item.clone()));
        }
    }

    let mut run_diffs = Vec::new();
    for run in a.active_processes() {
        match b.active_processes().find(|r| r.process_run_id == run.process_run_id) {
            None => run_diffs.push(RunDiff::OnlyInA(run.process_run_id)),
            Some(other) => {
                let mut mismatches = Vec::new();
                if other.process_id != run.process_id {
                    mismatches.push("process");
                }
                if other.start_time != run.start_time || other.end_time != run.end_time {
                    mismatches.push("window");
                }
                if other.inputs_consumed != run.inputs_consumed {
                    mismatches.push("inputs");
                }
                if other.machines_reserved != run.machines_reserved {
                    mismatches.push("machines");
                }
                if !mismatches.is_empty() {
                    run_diffs.push(RunDiff::StateMismatch {
                        run: run.process_run_id,
                        description: mismatches.join(", "),
                    });
                }
            }
        }
    }
    for run in b.active_processes() {
        if !a.active_processes().any(|r| r.process_run_id == run.process_run_id) {
            run_diffs.push(RunDiff::OnlyInB(run.process_run_id));
        }
    }

    let machines: BTreeSet<&MachineId> = sa
        .machines_built
        .keys()
        .chain(sb.machines_built.keys())
        .chain(sa.machines_in_use.keys())
        .chain(sb.machines_in_use.keys())
        .collect();
    let machine_diffs: Vec<MachineId> = machines
        .into_iter()
        .filter(|m| {
            sa.machines_built_of(m) != sb.machines_built_of(m)
                || sa.machines_in_use_of(m) != sb.machines_in_use_of(m)
        })
        .cloned()
        .collect();

    let is_identical = inventory_diffs.is_empty()
        && run_diffs.is_empty()
        && machine_diffs.is_empty()
        && subsystem_diffs.all_match();

    StateDiff {
        is_identical,
        subsystem_diffs,
        inventory_diffs,
        run_diffs,
        machine_diffs,
    }
}

// ---------------------------------------------------------------------------
// Determinism validation
// ---------------------------------------------------------------------------

/// Result of a determinism validation run.
#[derive(Debug)]
pub struct DeterminismResult {
    /// Whether the two runs produced identical results.
    pub is_deterministic: bool,
    /// Simulated time at which divergence was first detected (if any).
    pub divergence_at: Option<Hours>,
    /// Hash log: (time, hash_run1, hash_run2) after each step.
    pub hash_log: Vec<(Hours, u64, u64)>,
}

/// Restore two engines from the same snapshot, advance both by `step`
/// `steps` times, and compare their hashes after every step.
pub fn validate_determinism(
    snapshot_data: &[u8],
    defs: Arc<dyn DefinitionStore>,
    units: Arc<dyn UnitConverter>,
    step: Hours,
    steps: usize,
) -> Result<DeterminismResult, DeserializeError> {
    let mut engine_a = SimulationEngine::from_snapshot_bytes(snapshot_data, Arc::clone(&defs), Arc::clone(&units))?;
    let mut engine_b = SimulationEngine::from_snapshot_bytes(snapshot_data, defs, units)?;

    let mut hash_log = Vec::with_capacity(steps);
    let mut divergence_at = None;

    for _ in 0..steps {
        let ok_a = engine_a.advance_time(step).is_ok();
        let ok_b = engine_b.advance_time(step).is_ok();

        let hash_a = engine_a.state_hash();
        let hash_b = engine_b.state_hash();
        let time = engine_a.current_time();
        hash_log.push((time, hash_a, hash_b));

        if (hash_a != hash_b || ok_a != ok_b) && divergence_at.is_none() {
            divergence_at = Some(time);
        }
    }

    Ok(DeterminismResult {
        is_deterministic: divergence_at.is_none(),
        divergence_at,
        hash_log,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
