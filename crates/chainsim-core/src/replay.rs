//! Rebuild an engine from its lifecycle log.
//!
//! Replay re-applies each record's recorded effect (stock moved, machines
//! put in use or released, steps advanced) without consulting process
//! formulas or re-running admission. Runs still in flight at the end of the
//! log get their pending events and machine holds restored, so the rebuilt
//! engine continues exactly as the live one would have.

use crate::config::EngineConfig;
use crate::dependency::DependencyGraph;
use crate::engine::{payload_holds, releases_early, IdCounters, SimulationEngine};
use crate::event::{EventPayload, ProcessPayload};
use crate::fixed::Hours;
use crate::id::{EventId, MachineId, ProcessRunId, RecipeRunId};
use crate::inventory::InventoryError;
use crate::journal::LogRecord;
use crate::orchestrator::RecipeRun;
use crate::registry::DefinitionStore;
use crate::scheduler::{ProcessRun, SchedulerError};
use crate::units::UnitConverter;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// ReplayError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("record {index}: {message}")]
    Inconsistent { index: usize, message: String },
    #[error("record {index}: {source}")]
    Inventory {
        index: usize,
        #[source]
        source: InventoryError,
    },
    #[error("restoring pending events: {0}")]
    Scheduler(#[from] SchedulerError),
}

// ---------------------------------------------------------------------------
// Replayer
// ---------------------------------------------------------------------------

/// Where a logged run stands after the records read so far.
#[derive(Debug, Clone)]
struct RunTrack {
    payload: ProcessPayload,
    started: bool,
    released: BTreeSet<MachineId>,
    finished: bool,
}

#[derive(Debug)]
struct Replayer {
    engine: SimulationEngine,
    runs: BTreeMap<ProcessRunId, RunTrack>,
    /// Run ids in scheduling order.
    order: Vec<ProcessRunId>,
    retries: Vec<(RecipeRunId, u64, Hours)>,
    counters: IdCounters,
}

impl Replayer {
    fn track(&mut self, index: usize, run: ProcessRunId) -> Result<&mut RunTrack, ReplayError> {
        self.runs.get_mut(&run).ok_or_else(|| ReplayError::Inconsistent {
            index,
            message: format!("{run} was never scheduled"),
        })
    }

    fn apply(&mut self, index: usize, record: &LogRecord) -> Result<(), ReplayError> {
        let defs = Arc::clone(&self.engine.defs);
        let units = Arc::clone(&self.engine.units);
        let stock_err = |source| ReplayError::Inventory { index, source };
        let capacity_err = |e: crate::error::SimError| ReplayError::Inconsistent {
            index,
            message: e.to_string(),
        };

        match record {
            LogRecord::Import { item, qty, unit, machine_units, .. } => {
                let def = defs.get_item(item);
                let state = &mut self.engine.state;
                state.inventory.add(item, *qty, unit, units.as_ref(), def).map_err(stock_err)?;
                state.total_imports.add(item, *qty, unit, units.as_ref(), def).map_err(stock_err)?;
                if let Some(count) = machine_units {
                    self.engine
                        .add_capacity(&MachineId::new(item.as_str()), *count)
                        .map_err(capacity_err)?;
                }
            }
            LogRecord::Build { machine, count, consumed, .. } => {
                for flow in consumed {
                    let def = defs.get_item(&flow.item);
                    self.engine
                        .state
                        .inventory
                        .take(&flow.item, flow.qty, &flow.unit, units.as_ref(), def)
                        .map_err(stock_err)?;
                }
                self.engine.add_capacity(machine, *count).map_err(capacity_err)?;
            }
            LogRecord::RecipeStarted { time, recipe_run, recipe } => {
                let graph = DependencyGraph::from_steps(&recipe.steps).map_err(|e| ReplayError::Inconsistent {
                    index,
                    message: e.to_string(),
                })?;
                self.engine
                    .orchestrator
                    .insert(RecipeRun::new(*recipe_run, recipe.clone(), graph, *time));
                self.counters.next_recipe_run = self.counters.next_recipe_run.max(recipe_run.0 + 1);
            }
            LogRecord::RecipeCancelled { recipe_run, .. } => {
                self.engine.orchestrator.cancel_run(*recipe_run);
            }
            LogRecord::StepStalled { recipe_run, step, .. } => {
                self.engine.orchestrator.mark_stalled(*recipe_run, *step);
            }
            LogRecord::RetryScheduled { recipe_run, attempt, at, .. } => {
                self.retries.push((*recipe_run, *attempt, *at));
                self.counters.next_retry = self.counters.next_retry.max(attempt + 1);
            }
            LogRecord::ProcessScheduled { payload, .. } => {
                let run = payload.run;
                if let Some(link) = payload.recipe {
                    self.engine.orchestrator.mark_scheduled(link.recipe_run, link.step_index, run);
                }
                self.runs.insert(
                    run,
                    RunTrack {
                        payload: payload.clone(),
                        started: false,
                        released: BTreeSet::new(),
                        finished: false,
                    },
                );
                self.order.push(run);
                self.counters.next_process_run = self.counters.next_process_run.max(run.0 + 1);
            }
            LogRecord::ProcessStarted { run, inputs, energy_kwh, .. } => {
                for flow in inputs {
                    let def = defs.get_item(&flow.item);
                    self.engine
                        .state
                        .inventory
                        .take(&flow.item, flow.qty, &flow.unit, units.as_ref(), def)
                        .map_err(stock_err)?;
                }
                let track = self.track(index, *run)?;
                track.started = true;
                let payload = track.payload.clone();
                for hold in payload_holds(&payload) {
                    self.engine.state.adjust_in_use(&hold.machine_id, hold.qty_reserved);
                }
                self.engine.state.total_energy_kwh = self.engine.state.total_energy_kwh.saturating_add(*energy_kwh);
                self.engine.scheduler.restore_active(ProcessRun::from_payload(&payload));
                if let Some(link) = payload.recipe {
                    self.engine.orchestrator.restore_step_active(link.recipe_run, link.step_index, *run);
                }
            }
            LogRecord::MachineReleased { run, machine, qty, .. } => {
                self.track(index, *run)?.released.insert(machine.clone());
                self.engine.state.adjust_in_use(machine, -*qty);
            }
            LogRecord::ProcessCompleted { time, run, outputs } => {
                for flow in outputs {
                    let def = defs.get_item(&flow.item);
                    self.engine
                        .state
                        .inventory
                        .add(&flow.item, flow.qty, &flow.unit, units.as_ref(), def)
                        .map_err(stock_err)?;
                }
                let track = self.track(index, *run)?;
                track.finished = true;
                let payload = track.payload.clone();
                for hold in payload_holds(&payload).into_iter().filter(|h| !releases_early(h)) {
                    self.engine.state.adjust_in_use(&hold.machine_id, -hold.qty_reserved);
                }
                let mut finished = ProcessRun::from_payload(&payload);
                finished.energy_kwh = Some(payload.energy_kwh);
                self.engine.scheduler.restore_completed(finished);
                if let Some(link) = payload.recipe {
                    self.engine
                        .orchestrator
                        .restore_step_completed(link.recipe_run, link.step_index, *time);
                }
            }
            LogRecord::ProcessCancelled { run, .. } => {
                let track = self.track(index, *run)?;
                track.finished = true;
                let track = track.clone();
                if track.started {
                    for hold in payload_holds(&track.payload) {
                        if !releases_early(&hold) || !track.released.contains(&hold.machine_id) {
                            self.engine.state.adjust_in_use(&hold.machine_id, -hold.qty_reserved);
                        }
                    }
                    self.engine.scheduler.cancel_process(*run);
                }
                if let Some(link) = track.payload.recipe {
                    self.engine.orchestrator.unschedule(link.recipe_run, link.step_index);
                }
            }
            LogRecord::StateSnapshot { .. } => {}
        }
        Ok(())
    }

    /// Move the clock to `time` and restore everything still in flight.
    fn finish(mut self, time: Hours) -> Result<SimulationEngine, ReplayError> {
        self.engine.scheduler.set_time(time)?;
        self.engine.state.current_time_hours = time;

        for run in &self.order {
            let Some(track) = self.runs.get(run) else { continue };
            if track.finished {
                continue;
            }
            let payload = &track.payload;
            if track.started {
                self.engine.scheduler.schedule_event(
                    payload.end_time(),
                    EventId::complete(*run),
                    EventPayload::ProcessComplete(payload.clone()),
                )?;
            } else {
                self.engine.scheduler.schedule_process_start(payload.clone())?;
            }
            for hold in payload_holds(payload) {
                if releases_early(&hold) && !track.released.contains(&hold.machine_id) {
                    self.engine.scheduler.schedule_event(
                        hold.release_time(),
                        EventId::release(*run, &hold.machine_id),
                        EventPayload::MachineRelease {
                            run: *run,
                            machine: hold.machine_id.clone(),
                            qty: hold.qty_reserved,
                        },
                    )?;
                }
                self.engine.reservations.restore(hold);
            }
        }

        for (recipe_run, attempt, at) in &self.retries {
            if *at > time {
                self.engine.scheduler.schedule_event(
                    *at,
                    EventId::step_ready(*recipe_run, *attempt),
                    EventPayload::RecipeStepReady { recipe_run: *recipe_run },
                )?;
            }
        }

        self.engine.counters = self.counters;
        Ok(self.engine)
    }
}

// ---------------------------------------------------------------------------
// Replay execution
// ---------------------------------------------------------------------------

/// Rebuild an engine by re-applying every record in `log`, in order.
///
/// A trailing tick record carries the live engine's state hash; a mismatch
/// is logged but does not fail the replay.
pub fn replay_log(
    config: EngineConfig,
    defs: Arc<dyn DefinitionStore>,
    units: Arc<dyn UnitConverter>,
    log: &[LogRecord],
) -> Result<SimulationEngine, ReplayError> {
    let engine = SimulationEngine::with_units(config, defs, units);
    let mut time = engine.current_time();
    let mut replayer = Replayer {
        engine,
        runs: BTreeMap::new(),
        order: Vec::new(),
        retries: Vec::new(),
        counters: IdCounters::default(),
    };

    for (index, record) in log.iter().enumerate() {
        time = time.max(record.time());
        replayer.apply(index, record)?;
    }
    let engine = replayer.finish(time)?;

    if let Some(LogRecord::StateSnapshot { state_hash, .. }) = log.last() {
        let actual = engine.state_hash();
        if actual != *state_hash {
            warn!(expected = *state_hash, actual, "replayed state differs from logged hash");
        }
    }
    debug!(records = log.len(), time = %time, "log replayed");
    Ok(engine)
}

/// Whether replaying `log` lands on the hash its last tick record carries.
/// `None` when the log does not end with a tick.
pub fn verify_log(
    config: EngineConfig,
    defs: Arc<dyn DefinitionStore>,
    units: Arc<dyn UnitConverter>,
    log: &[LogRecord],
) -> Result<Option<bool>, ReplayError> {
    let Some(LogRecord::StateSnapshot { state_hash, .. }) = log.last() else {
        return Ok(None);
    };
    let engine = replay_log(config, defs, units, log)?;
    Ok(Some(engine.state_hash() == *state_hash))
}

// ===========================================================================
// Tests
// ===========================================================================
