//! Snapshot serialization for the simulation engine.
//!
//! A snapshot is a fixed 16-byte header (magic, format version, simulated
//! time) followed by a `bitcode` payload holding every engine subsystem.
//! The header is checked before the payload is decoded, so a foreign or
//! newer file fails fast with a typed error. Also provides per-subsystem
//! hashing for locating divergence between two engines.

use crate::config::EngineConfig;
use crate::engine::{IdCounters, SimulationEngine};
use crate::fixed::{Fixed64, Hours};
use crate::orchestrator::RecipeOrchestrator;
use crate::registry::DefinitionStore;
use crate::reservation::{MachineReservationManager, ReservationState};
use crate::scheduler::{Scheduler, SchedulerState};
use crate::sim::{SimulationState, StateHash};
use crate::units::UnitConverter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a chainsim engine snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0xC5A1_0001;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

/// Bytes taken by the header in front of the payload.
pub const HEADER_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during serialization.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

/// Errors that can occur during deserialization.
#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("data too short for snapshot header")]
    TooShort,
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SNAPSHOT_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("snapshot from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
    #[error("snapshot for {found} cannot be loaded as {expected}")]
    SimIdMismatch { expected: String, found: String },
}

// ---------------------------------------------------------------------------
// Snapshot header
// ---------------------------------------------------------------------------

/// Header prepended to every serialized snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    /// Simulated time the snapshot was taken at.
    pub time: Hours,
}

impl SnapshotHeader {
    /// Create a header for the current format version.
    pub fn new(time: Hours) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            time,
        }
    }

    /// Validate the header. Returns `Ok(())` if valid.
    pub fn validate(&self) -> Result<(), DeserializeError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(DeserializeError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..16].copy_from_slice(&self.time.to_bits().to_le_bytes());
        out
    }

    fn from_bytes(data: &[u8]) -> Result<Self, DeserializeError> {
        let word = |range: std::ops::Range<usize>| -> Result<u32, DeserializeError> {
            let bytes: [u8; 4] = data
                .get(range)
                .and_then(|b| b.try_into().ok())
                .ok_or(DeserializeError::TooShort)?;
            Ok(u32::from_le_bytes(bytes))
        };
        let time_bytes: [u8; 8] = data
            .get(8..HEADER_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(DeserializeError::TooShort)?;
        Ok(Self {
            magic: word(0..4)?,
            version: word(4..8)?,
            time: Fixed64::from_bits(i64::from_le_bytes(time_bytes)),
        })
    }
}

/// Read and validate only the header of a snapshot.
pub fn read_snapshot_header(data: &[u8]) -> Result<SnapshotHeader, DeserializeError> {
    let header = SnapshotHeader::from_bytes(data)?;
    header.validate()?;
    Ok(header)
}

// ---------------------------------------------------------------------------
// Serializable engine state
// ---------------------------------------------------------------------------

/// The serializable portion of the engine. Excludes the definition store,
/// the unit converter, scheduler listeners and the unflushed journal.
#[derive(Debug, Serialize, Deserialize)]
struct EngineSnapshot {
    config: EngineConfig,
    state: SimulationState,
    scheduler: SchedulerState,
    reservations: ReservationState,
    orchestrator: RecipeOrchestrator,
    counters: IdCounters,
}

// ---------------------------------------------------------------------------
// SubsystemHashes
// ---------------------------------------------------------------------------

/// Per-subsystem state hashes. Lets two engines that disagree be narrowed
/// down to the subsystem that diverged.
///
/// Only replay-stable data is hashed: queue sequence numbers and the
/// processed-event counter are left out, since a replayed engine never
/// pops the events a live one did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsystemHashes {
    pub state: u64,
    pub scheduler: u64,
    pub reservations: u64,
    pub recipes: u64,
    pub counters: u64,
}

impl SubsystemHashes {
    /// Fold every subsystem hash into one value.
    pub fn combined(&self) -> u64 {
        let mut h = StateHash::new();
        for v in [self.state, self.scheduler, self.reservations, self.recipes, self.counters] {
            h.write_u64(v);
        }
        h.finish()
    }
}

// ---------------------------------------------------------------------------
// Engine serialization methods
// ---------------------------------------------------------------------------

impl SimulationEngine {
    /// Serialize the engine to header + bitcode payload.
    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        let snapshot = EngineSnapshot {
            config: self.config.clone(),
            state: self.state.clone(),
            scheduler: self.scheduler.to_state(),
            reservations: self.reservations.to_state(),
            orchestrator: self.orchestrator.clone(),
            counters: self.counters,
        };
        let payload =
            bitcode::serialize(&snapshot).map_err(|e| SerializeError::Encode(e.to_string()))?;
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&SnapshotHeader::new(self.state.current_time_hours).to_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Rebuild an engine from a snapshot.
    ///
    /// The header is validated before the payload is decoded. Listeners
    /// are not persisted and must be registered again.
    pub fn from_snapshot_bytes(
        data: &[u8],
        defs: Arc<dyn DefinitionStore>,
        units: Arc<dyn UnitConverter>,
    ) -> Result<Self, DeserializeError> {
        read_snapshot_header(data)?;
        let snapshot: EngineSnapshot = bitcode::deserialize(&data[HEADER_LEN..])
            .map_err(|e| DeserializeError::Decode(e.to_string()))?;
        let scheduler = Scheduler::from_state(snapshot.scheduler)
            .map_err(|e| DeserializeError::Decode(e.to_string()))?;
        Ok(SimulationEngine::from_parts(
            snapshot.config,
            defs,
            units,
            snapshot.state,
            scheduler,
            MachineReservationManager::from_state(snapshot.reservations),
            snapshot.orchestrator,
            snapshot.counters,
        ))
    }

    /// Compute per-subsystem state hashes.
    pub fn subsystem_hashes(&self) -> SubsystemHashes {
        SubsystemHashes {
            state: self.state.hash(),
            scheduler: self.hash_scheduler(),
            reservations: self.hash_reservations(),
            recipes: self.hash_recipes(),
            counters: self.hash_counters(),
        }
    }

    // -- Subsystem hash helpers --

    fn hash_scheduler(&self) -> u64 {
        let mut h = StateHash::new();
        h.write_fixed64(self.scheduler.current_time());
        h.write_u64(self.scheduler.pending_count() as u64);
        for event in self.scheduler.pending() {
            h.write_fixed64(event.time);
            h.write_u64(u64::from(event.priority));
            h.write(event.event_id.0.as_bytes());
            h.write_json(&event.payload);
        }
        h.write_u64(self.scheduler.active_count() as u64);
        for run in self.scheduler.active() {
            h.write_json(run);
        }
        h.write_u64(self.scheduler.completed().len() as u64);
        for run in self.scheduler.completed() {
            h.write_json(run);
        }
        h.finish()
    }

    fn hash_reservations(&self) -> u64 {
        let mut h = StateHash::new();
        for (machine, qty) in self.reservations.capacities() {
            h.write(machine.as_str().as_bytes());
            h.write_fixed64(*qty);
        }
        h.write_u64(self.reservations.reservations().len() as u64);
        for r in self.reservations.reservations() {
            h.write_json(r);
        }
        h.finish()
    }

    fn hash_recipes(&self) -> u64 {
        let mut h = StateHash::new();
        h.write_json(&self.orchestrator);
        h.finish()
    }

    fn hash_counters(&self) -> u64 {
        let mut h = StateHash::new();
        h.write_u64(self.counters.next_process_run);
        h.write_u64(self.counters.next_recipe_run);
        h.write_u64(self.counters.next_retry);
        h.finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
