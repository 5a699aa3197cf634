//! The simulation engine: owns every kernel component and is the only
//! writer of [`SimulationState`].
//!
//! # Architecture
//!
//! The `SimulationEngine` owns:
//! - A [`Scheduler`] (event queue, active and completed process runs)
//! - A [`MachineReservationManager`] (capacities pushed from `machines_built`)
//! - A [`RecipeOrchestrator`] (recipe-run step bookkeeping)
//! - The [`SimulationState`] (inventory, machines, totals, clock)
//! - A [`Journal`] of lifecycle records not yet written to a store
//!
//! # Process lifecycle
//!
//! `start_process` checks everything up front (definition, static rules,
//! sizing, inputs, machines) and mutates nothing unless every check passes.
//! Machine holds are taken speculatively and rolled back on the first
//! conflict. Inputs are only consumed when the START event fires; a run
//! whose inputs were taken by a sibling in the meantime is cancelled and
//! its holds released.
//!
//! # Tick
//!
//! `advance_time` retries stalled recipe steps, then drives
//! [`Scheduler::process_next`] one event at a time, applying engine effects
//! after each. Events queued while handling an event at `T` still fire in
//! the same tick when they are due.
//!
//! # Recipe correlation
//!
//! The [`RecipeOrchestrator`] is not registered through
//! [`Scheduler::on_event`]. The engine hands it each START and COMPLETE
//! right after applying the event's effects, because a step transition may
//! schedule follow-on steps and write journal records, which read-only
//! listeners cannot do. Listeners still see every recipe event first.

use crate::config::EngineConfig;
use crate::definition::{Flow, ItemKind, MachineRequirement, RuleViolation};
use crate::dependency::DependencyGraph;
use crate::error::{ErrorKind, Shortfall, SimError};
use crate::event::{EventKind, EventPayload, ProcessPayload, RecipeLink, SchedulerEvent};
use crate::fixed::{Fixed64, Hours, Quantity};
use crate::formula::{self, FormulaError, Sizing};
use crate::id::{EventId, ItemId, MachineId, ProcessId, ProcessRunId, RecipeId, RecipeRunId};
use crate::inventory::{Inventory, InventoryEntry, InventoryError};
use crate::journal::{Journal, LogRecord};
use crate::orchestrator::{RecipeOrchestrator, RecipeRun, StepTransition};
use crate::registry::DefinitionStore;
use crate::replay;
use crate::reservation::{MachineReservationManager, Reservation};
use crate::scheduler::{EventListener, ProcessRun, Scheduler};
use crate::sim::SimulationState;
use crate::store::SimStore;
use crate::units::{StandardUnits, UnitConverter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// A request to schedule one process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub process_id: ProcessId,
    pub sizing: Sizing,
    /// Defaults to the current time. Must not be in the past.
    pub start_time: Option<Hours>,
    /// Set when the run executes a recipe step.
    pub recipe: Option<RecipeLink>,
}

impl ProcessRequest {
    pub fn new(process_id: ProcessId) -> Self {
        Self {
            process_id,
            sizing: Sizing::default(),
            start_time: None,
            recipe: None,
        }
    }

    pub fn with_sizing(mut self, sizing: Sizing) -> Self {
        self.sizing = sizing;
        self
    }

    pub fn at(mut self, start_time: Hours) -> Self {
        self.start_time = Some(start_time);
        self
    }
}

/// A ready recipe step that could not be scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStall {
    pub recipe_run: RecipeRunId,
    pub step: usize,
    pub error: ErrorKind,
    pub message: String,
}

/// What one call to [`SimulationEngine::advance_time`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceReport {
    pub from: Hours,
    pub to: Hours,
    /// Every event processed, in firing order.
    pub processed: Vec<SchedulerEvent>,
    /// Runs scheduled during the tick (recipe steps).
    pub scheduled: Vec<ProcessRunId>,
    pub started: Vec<ProcessRunId>,
    pub completed: Vec<ProcessRunId>,
    /// Runs cancelled because their inputs were gone at START.
    pub cancelled: Vec<ProcessRunId>,
    pub recipes_completed: Vec<RecipeRunId>,
    pub stalled: Vec<StepStall>,
}

impl AdvanceReport {
    fn new(from: Hours, to: Hours) -> Self {
        Self { from, to, ..Self::default() }
    }
}

/// Read-only view of what the next tick would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub from: Hours,
    pub until: Hours,
    /// Every event that would fire, in order, including follow-on recipe
    /// steps queued during the tick.
    pub events: Vec<SchedulerEvent>,
    pub starting: Vec<ProcessRunId>,
    pub completing: Vec<ProcessRunId>,
    pub recipes_completing: Vec<RecipeRunId>,
}

/// Monotonic id counters. Persisted so a restored engine keeps allocating
/// the ids a cold run would.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCounters {
    pub next_process_run: u64,
    pub next_recipe_run: u64,
    pub next_retry: u64,
}

// ---------------------------------------------------------------------------
// Machine holds
// ---------------------------------------------------------------------------

/// The holds a run's machine requirements imply over `[start, end)`.
pub(crate) fn holds_for(
    run: ProcessRunId,
    machines: &[MachineRequirement],
    start: Hours,
    end: Hours,
) -> Vec<Reservation> {
    machines
        .iter()
        .filter_map(|req| Reservation::new_hold(&req.machine, run, start, end, req.qty, &req.unit).ok())
        .collect()
}

pub(crate) fn payload_holds(p: &ProcessPayload) -> Vec<Reservation> {
    holds_for(p.run, &p.machines, p.start_time, p.end_time())
}

/// Whether a hold is given back by its own MACHINE_RELEASE event rather
/// than at the run's completion.
pub(crate) fn releases_early(hold: &Reservation) -> bool {
    hold.release_time() < hold.end_time
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The discrete-event production simulation kernel.
#[derive(Debug)]
pub struct SimulationEngine {
    pub(crate) config: EngineConfig,
    pub(crate) defs: Arc<dyn DefinitionStore>,
    pub(crate) units: Arc<dyn UnitConverter>,
    pub(crate) state: SimulationState,
    pub(crate) scheduler: Scheduler,
    pub(crate) reservations: MachineReservationManager,
    pub(crate) orchestrator: RecipeOrchestrator,
    pub(crate) journal: Journal,
    pub(crate) counters: IdCounters,
}

impl SimulationEngine {
    /// Create an engine using the built-in unit table.
    pub fn new(config: EngineConfig, defs: Arc<dyn DefinitionStore>) -> Self {
        Self::with_units(config, defs, Arc::new(StandardUnits))
    }

    pub fn with_units(
        config: EngineConfig,
        defs: Arc<dyn DefinitionStore>,
        units: Arc<dyn UnitConverter>,
    ) -> Self {
        let start = config.start_time();
        let state = SimulationState::new(config.sim_id.clone(), start);
        let scheduler = Scheduler::with_priorities(start, config.priorities);
        Self::from_parts(
            config,
            defs,
            units,
            state,
            scheduler,
            MachineReservationManager::new(),
            RecipeOrchestrator::new(),
            IdCounters::default(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        config: EngineConfig,
        defs: Arc<dyn DefinitionStore>,
        units: Arc<dyn UnitConverter>,
        state: SimulationState,
        scheduler: Scheduler,
        reservations: MachineReservationManager,
        orchestrator: RecipeOrchestrator,
        counters: IdCounters,
    ) -> Self {
        Self {
            config,
            defs,
            units,
            state,
            scheduler,
            reservations,
            orchestrator,
            journal: Journal::new(),
            counters,
        }
    }

    /// Register a read-only listener for events of `kind`. Listeners run
    /// after the scheduler's own handling and before the engine's effects.
    pub fn on_event(&mut self, kind: EventKind, listener: EventListener) {
        self.scheduler.on_event(kind, listener);
    }

    // -----------------------------------------------------------------------
    // Inventory and machines
    // -----------------------------------------------------------------------

    /// Add externally supplied stock. Machine items also raise capacity.
    pub fn import_item(&mut self, item: &ItemId, qty: Quantity, unit: &str) -> Result<(), SimError> {
        let defs = Arc::clone(&self.defs);
        let units = Arc::clone(&self.units);
        let def = defs
            .get_item(item)
            .ok_or_else(|| SimError::KbGap(format!("item {item}")))?;
        if qty <= Fixed64::ZERO {
            return Err(SimError::validation(vec![RuleViolation::new(
                "positive_quantity",
                format!("import of {item} must be positive, got {qty}"),
            )]));
        }
        if units.convert(Fixed64::ONE, unit, &def.unit, Some(def)).is_none() {
            return Err(SimError::validation(vec![RuleViolation::new(
                "convertible_unit",
                format!("{item} is stocked in '{}', cannot import '{unit}'", def.unit),
            )]));
        }
        let rejected = |e: InventoryError| SimError::validation(vec![stock_violation(&e)]);

        let mut inventory = self.state.inventory.clone();
        inventory.add(item, qty, unit, units.as_ref(), Some(def)).map_err(rejected)?;
        let mut totals = self.state.total_imports.clone();
        totals.add(item, qty, unit, units.as_ref(), Some(def)).map_err(rejected)?;
        let machine_units = match def.kind {
            ItemKind::Machine => Some(units.convert(qty, unit, "count", Some(def)).ok_or_else(|| {
                SimError::validation(vec![RuleViolation::new(
                    "machine_count",
                    format!("machine {item} cannot be imported in '{unit}'"),
                )])
            })?),
            _ => None,
        };

        let now = self.current_time();
        if let Some(count) = machine_units {
            self.add_capacity(&MachineId::new(item.as_str()), count)?;
        }
        self.state.inventory = inventory;
        self.state.total_imports = totals;
        info!(item = %item, qty = %qty, unit, "imported");
        self.journal.record(LogRecord::Import {
            time: now,
            item: item.clone(),
            qty,
            unit: unit.to_string(),
            machine_units,
        });
        Ok(())
    }

    /// Consume a machine's bill of materials `count` times and add the
    /// machines to capacity. All or nothing.
    pub fn build_machine(&mut self, machine: &MachineId, count: Quantity) -> Result<(), SimError> {
        let defs = Arc::clone(&self.defs);
        let units = Arc::clone(&self.units);
        defs.get_machine(machine)
            .ok_or_else(|| SimError::KbGap(format!("machine {machine}")))?;
        let bom = defs
            .get_bom(machine)
            .ok_or_else(|| SimError::KbGap(format!("bom for {machine}")))?;
        if count <= Fixed64::ZERO {
            return Err(SimError::validation(vec![RuleViolation::new(
                "positive_quantity",
                format!("build count for {machine} must be positive, got {count}"),
            )]));
        }

        let mut scratch = self.state.inventory.clone();
        let mut consumed = Vec::with_capacity(bom.components.len());
        let mut shortfalls = Vec::new();
        for component in &bom.components {
            let needed = component.qty.checked_mul(count).ok_or_else(|| {
                SimError::validation(vec![RuleViolation::new(
                    "quantity_overflow",
                    format!("{} x {count} overflows", component.item),
                )])
            })?;
            let def = defs.get_item(&component.item);
            match scratch.take(&component.item, needed, &component.unit, units.as_ref(), def) {
                Ok(()) => consumed.push(Flow { item: component.item.clone(), qty: needed, unit: component.unit.clone() }),
                Err(e) => shortfalls.push(shortfall_from(e, &component.item, needed, &component.unit)),
            }
        }
        if !shortfalls.is_empty() {
            return Err(SimError::InsufficientInputs { shortfalls });
        }

        let now = self.current_time();
        self.add_capacity(machine, count)?;
        self.state.inventory = scratch;
        info!(machine = %machine, count = %count, "built");
        self.journal.record(LogRecord::Build {
            time: now,
            machine: machine.clone(),
            count,
            consumed,
        });
        Ok(())
    }

    /// Raise a machine's built count. Nothing changes if the total would
    /// overflow.
    pub(crate) fn add_capacity(&mut self, machine: &MachineId, count: Quantity) -> Result<(), SimError> {
        let built = self
            .state
            .machines_built_of(machine)
            .checked_add(count)
            .ok_or_else(|| {
                SimError::validation(vec![RuleViolation::new(
                    "quantity_overflow",
                    format!("{machine} capacity overflows"),
                )])
            })?;
        self.state.machines_built.insert(machine.clone(), built);
        self.reservations.set_capacity(machine, built);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Processes
    // -----------------------------------------------------------------------

    /// Schedule one process run. On error nothing has changed.
    pub fn start_process(&mut self, request: ProcessRequest) -> Result<ProcessRunId, SimError> {
        let now = self.current_time();
        let start = request.start_time.unwrap_or(now);
        if start < now {
            return Err(SimError::validation(vec![RuleViolation::new(
                "start_not_in_past",
                format!("start time {start} is before current time {now}"),
            )]));
        }

        let defs = Arc::clone(&self.defs);
        let def = defs
            .get_process(&request.process_id)
            .ok_or_else(|| SimError::KbGap(format!("process {}", request.process_id)))?;
        let violations = def.validate();
        if !violations.is_empty() {
            return Err(SimError::validation(violations));
        }
        let sized = formula::size_process(def, &request.sizing, self.units.as_ref(), defs.as_ref())?;
        self.check_outputs(&sized.outputs)?;
        let inputs = self.resolve_inputs(&sized.inputs)?;

        let run = ProcessRunId(self.counters.next_process_run);
        let end = start
            .checked_add(sized.duration_hours)
            .ok_or_else(|| FormulaError::Overflow(def.id.clone()))?;
        self.reserve_machines(run, &def.machines, start, end)?;

        let payload = ProcessPayload {
            run,
            process: def.id.clone(),
            scale: sized.scale,
            start_time: start,
            duration_hours: sized.duration_hours,
            inputs,
            outputs: sized.outputs,
            machines: def.machines.clone(),
            energy_kwh: sized.energy_kwh,
            recipe: request.recipe,
        };
        if let Err(e) = self.queue_run_events(&payload) {
            self.reservations.remove_reservation(run);
            return Err(e);
        }

        self.counters.next_process_run += 1;
        if let Some(link) = payload.recipe {
            self.orchestrator.mark_scheduled(link.recipe_run, link.step_index, run);
        }
        info!(run = %run, process = %payload.process, start = %start, end = %end, "process scheduled");
        self.journal.record(LogRecord::ProcessScheduled { time: now, payload });
        Ok(run)
    }

    /// Pick the items a run will consume, substituting within a material
    /// class when allowed. Checks against a scratch copy of the inventory so
    /// that two lines drawing on the same item are both accounted for.
    fn resolve_inputs(&self, inputs: &[Flow]) -> Result<Vec<Flow>, SimError> {
        let units = self.units.as_ref();
        let mut scratch = self.state.inventory.clone();
        let mut resolved = Vec::with_capacity(inputs.len());
        let mut shortfalls = Vec::new();
        for flow in inputs {
            let def = self.defs.get_item(&flow.item);
            match scratch.take(&flow.item, flow.qty, &flow.unit, units, def) {
                Ok(()) => resolved.push(flow.clone()),
                Err(e) => match self.substitute_for(flow, &mut scratch) {
                    Some(sub) => {
                        debug!(wanted = %flow.item, using = %sub.item, "material substitution");
                        resolved.push(sub);
                    }
                    None => shortfalls.push(shortfall_from(e, &flow.item, flow.qty, &flow.unit)),
                },
            }
        }
        if shortfalls.is_empty() {
            Ok(resolved)
        } else {
            Err(SimError::InsufficientInputs { shortfalls })
        }
    }

    /// Every output must be stockable when the run completes: convertible
    /// into its item's unit and the unit it is held in, without overflow.
    fn check_outputs(&self, outputs: &[Flow]) -> Result<(), SimError> {
        let units = self.units.as_ref();
        let mut scratch = self.state.inventory.clone();
        let mut violations = Vec::new();
        for flow in outputs {
            let def = self.defs.get_item(&flow.item);
            if let Some(def) = def {
                if units.convert(Fixed64::ONE, &flow.unit, &def.unit, Some(def)).is_none() {
                    violations.push(RuleViolation::new(
                        "convertible_output",
                        format!("{} in '{}' cannot be stocked as '{}'", flow.item, flow.unit, def.unit),
                    ));
                    continue;
                }
            }
            if let Err(e) = scratch.add(&flow.item, flow.qty, &flow.unit, units, def) {
                violations.push(stock_violation(&e));
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(SimError::validation(violations))
        }
    }

    fn substitute_for(&self, flow: &Flow, scratch: &mut Inventory) -> Option<Flow> {
        if !self.config.allow_material_substitution {
            return None;
        }
        let class = self.defs.get_item(&flow.item)?.material_class.as_deref()?;
        self.defs
            .items_in_class(class)
            .into_iter()
            .filter(|candidate| candidate.id != flow.item)
            .find(|candidate| {
                scratch
                    .take(&candidate.id, flow.qty, &flow.unit, self.units.as_ref(), Some(*candidate))
                    .is_ok()
            })
            .map(|candidate| Flow { item: candidate.id.clone(), qty: flow.qty, unit: flow.unit.clone() })
    }

    /// Take every machine hold for a run, rolling all of them back on the
    /// first failure.
    fn reserve_machines(
        &mut self,
        run: ProcessRunId,
        machines: &[MachineRequirement],
        start: Hours,
        end: Hours,
    ) -> Result<(), SimError> {
        for req in machines {
            let added = self
                .reservations
                .add_reservation(&req.machine, run, start, end, req.qty, &req.unit)
                .map(|_| ());
            if let Err(source) = added {
                self.reservations.remove_reservation(run);
                debug!(run = %run, machine = %req.machine, error = %source, "reservation rolled back");
                return Err(SimError::MachineConflict { machine: req.machine.clone(), source });
            }
        }
        Ok(())
    }

    /// Queue START, COMPLETE and any early MACHINE_RELEASE events for a run.
    fn queue_run_events(&mut self, payload: &ProcessPayload) -> Result<(), SimError> {
        self.scheduler.schedule_process_start(payload.clone())?;
        for hold in payload_holds(payload).into_iter().filter(releases_early) {
            let event = EventPayload::MachineRelease {
                run: payload.run,
                machine: hold.machine_id.clone(),
                qty: hold.qty_reserved,
            };
            let id = EventId::release(payload.run, &hold.machine_id);
            if let Err(e) = self.scheduler.schedule_event(hold.release_time(), id, event) {
                self.scheduler.cancel_process(payload.run);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Drop a run that has not completed: its queued events, its holds and,
    /// if it had started, the machine units it still had in use.
    fn cancel_run(&mut self, run: ProcessRunId, reason: &str) {
        let now = self.current_time();
        let pending_releases: Vec<MachineId> = self
            .reservations
            .reservations_for(run)
            .filter(|r| releases_early(r) && self.scheduler.is_pending(&EventId::release(run, &r.machine_id)))
            .map(|r| r.machine_id.clone())
            .collect();
        if let Some(active) = self.scheduler.cancel_process(run) {
            for hold in holds_for(run, &active.machines_reserved, active.start_time, active.end_time) {
                if !releases_early(&hold) || pending_releases.contains(&hold.machine_id) {
                    self.state.adjust_in_use(&hold.machine_id, -hold.qty_reserved);
                }
            }
        }
        self.reservations.remove_reservation(run);
        warn!(run = %run, reason, "process cancelled");
        self.journal.record(LogRecord::ProcessCancelled {
            time: now,
            run,
            reason: reason.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Recipes
    // -----------------------------------------------------------------------

    /// Start a recipe run and schedule its depth-0 steps.
    ///
    /// A step blocked by a machine stalls and is retried later. Any other
    /// step failure cancels the whole run, which stays recorded as
    /// cancelled.
    pub fn run_recipe(&mut self, recipe_id: &RecipeId) -> Result<RecipeRunId, SimError> {
        let now = self.current_time();
        let recipe = self
            .defs
            .get_recipe(recipe_id)
            .ok_or_else(|| SimError::KbGap(format!("recipe {recipe_id}")))?
            .clone();
        if let Some(step) = recipe.steps.iter().find(|s| self.defs.get_process(&s.process).is_none()) {
            return Err(SimError::KbGap(format!("process {}", step.process)));
        }
        let graph = DependencyGraph::from_steps(&recipe.steps)?;

        let id = RecipeRunId(self.counters.next_recipe_run);
        self.counters.next_recipe_run += 1;
        self.orchestrator.insert(RecipeRun::new(id, recipe.clone(), graph, now));
        info!(recipe_run = %id, recipe = %recipe_id, steps = recipe.steps.len(), "recipe started");
        self.journal.record(LogRecord::RecipeStarted { time: now, recipe_run: id, recipe });

        for step in self.orchestrator.newly_ready(id) {
            match self.schedule_step(id, step) {
                Ok(_) => {}
                Err(e) if e.is_machine_conflict() => {
                    self.stall(id, step, &e)?;
                }
                Err(e) => {
                    self.cancel_recipe_run(id, &format!("step {step} failed: {e}"));
                    return Err(SimError::StepSchedulingFailed { step, cause: Box::new(e) });
                }
            }
        }
        Ok(id)
    }

    fn schedule_step(&mut self, recipe_run: RecipeRunId, step: usize) -> Result<ProcessRunId, SimError> {
        let definition = self
            .orchestrator
            .get(recipe_run)
            .and_then(|rr| rr.recipe.steps.get(step))
            .cloned()
            .ok_or_else(|| SimError::Internal(format!("{recipe_run} has no step {step}")))?;
        let sizing = Sizing {
            scale: definition.scale,
            duration_hours: definition.duration_hours,
            output: None,
        };
        self.start_process(ProcessRequest {
            process_id: definition.process,
            sizing,
            start_time: None,
            recipe: Some(RecipeLink { recipe_run, step_index: step }),
        })
    }

    /// Schedule every ready step of a recipe run; stall the ones that fail.
    fn schedule_ready_steps(&mut self, recipe_run: RecipeRunId, report: &mut AdvanceReport) -> Result<(), SimError> {
        for step in self.orchestrator.newly_ready(recipe_run) {
            match self.schedule_step(recipe_run, step) {
                Ok(run) => report.scheduled.push(run),
                Err(e) => {
                    let stall = self.stall(recipe_run, step, &e)?;
                    report.stalled.push(stall);
                }
            }
        }
        Ok(())
    }

    /// Put a step in the stalled set. A machine conflict also queues a
    /// retry at the blocking machine's next release.
    fn stall(&mut self, recipe_run: RecipeRunId, step: usize, error: &SimError) -> Result<StepStall, SimError> {
        self.mark_stalled(recipe_run, step);
        match error {
            SimError::MachineConflict { machine, .. } => {
                debug!(recipe_run = %recipe_run, step, machine = %machine, "step waiting for machine");
                self.schedule_retry(recipe_run, machine)?;
            }
            other => warn!(recipe_run = %recipe_run, step, error = %other, "step stalled"),
        }
        Ok(StepStall {
            recipe_run,
            step,
            error: error.kind(),
            message: error.to_string(),
        })
    }

    fn mark_stalled(&mut self, recipe_run: RecipeRunId, step: usize) {
        let already = self
            .orchestrator
            .get(recipe_run)
            .is_some_and(|rr| rr.stalled_steps.contains(&step));
        if already {
            return;
        }
        self.orchestrator.mark_stalled(recipe_run, step);
        self.journal.record(LogRecord::StepStalled {
            time: self.current_time(),
            recipe_run,
            step,
        });
    }

    fn schedule_retry(&mut self, recipe_run: RecipeRunId, machine: &MachineId) -> Result<(), SimError> {
        let now = self.current_time();
        match self.reservations.next_release_after(machine, now) {
            Some(at) => self.queue_step_ready(recipe_run, at),
            None => Ok(()),
        }
    }

    /// Queue a RECIPE_STEP_READY for a run at `at`, unless one is already
    /// queued for that instant.
    fn queue_step_ready(&mut self, recipe_run: RecipeRunId, at: Hours) -> Result<(), SimError> {
        let now = self.current_time();
        let queued = self.scheduler.pending().any(|e| {
            e.time == at && matches!(e.payload, EventPayload::RecipeStepReady { recipe_run: r } if r == recipe_run)
        });
        if queued {
            return Ok(());
        }
        let attempt = self.counters.next_retry;
        self.scheduler.schedule_event(
            at,
            EventId::step_ready(recipe_run, attempt),
            EventPayload::RecipeStepReady { recipe_run },
        )?;
        self.counters.next_retry += 1;
        self.journal.record(LogRecord::RetryScheduled { time: now, recipe_run, attempt, at });
        Ok(())
    }

    fn cancel_recipe_run(&mut self, recipe_run: RecipeRunId, reason: &str) {
        for run in self.orchestrator.cancel_run(recipe_run) {
            self.cancel_run(run, reason);
        }
        warn!(recipe_run = %recipe_run, reason, "recipe cancelled");
        self.journal.record(LogRecord::RecipeCancelled {
            time: self.current_time(),
            recipe_run,
        });
    }

    fn retry_stalled(&mut self, report: &mut AdvanceReport) -> Result<(), SimError> {
        let waiting: Vec<RecipeRunId> = self
            .orchestrator
            .active_runs()
            .filter(|rr| !rr.stalled_steps.is_empty())
            .map(|rr| rr.recipe_run_id)
            .collect();
        for recipe_run in waiting {
            self.schedule_ready_steps(recipe_run, report)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance simulated time by `duration`, processing every due event.
    pub fn advance_time(&mut self, duration: Hours) -> Result<AdvanceReport, SimError> {
        if duration < Fixed64::ZERO {
            return Err(SimError::AdvanceFailed(format!("negative duration {duration}")));
        }
        let from = self.current_time();
        let target = from
            .checked_add(duration)
            .ok_or_else(|| SimError::AdvanceFailed(format!("{from} + {duration} overflows")))?;
        let mut report = AdvanceReport::new(from, target);

        self.retry_stalled(&mut report)?;
        while let Some(event) = self
            .scheduler
            .process_next(target)
            .map_err(|e| SimError::AdvanceFailed(e.to_string()))?
        {
            self.state.current_time_hours = self.scheduler.current_time();
            debug!(event = %event.event_id, time = %event.time, "event");
            self.apply_event(&event, &mut report)?;
            report.processed.push(event);
        }
        self.scheduler
            .set_time(target)
            .map_err(|e| SimError::AdvanceFailed(e.to_string()))?;
        self.state.current_time_hours = target;

        let state_hash = self.state_hash();
        self.journal.record(LogRecord::StateSnapshot {
            time: target,
            state_hash,
            active_processes: self.scheduler.active_count(),
            pending_events: self.scheduler.pending_count(),
        });
        info!(
            from = %from,
            to = %target,
            processed = report.processed.len(),
            completed = report.completed.len(),
            "advanced"
        );
        Ok(report)
    }

    fn apply_event(&mut self, event: &SchedulerEvent, report: &mut AdvanceReport) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::ProcessStart(p) => self.on_process_start(event, p, report),
            EventPayload::ProcessComplete(p) => self.on_process_complete(event, p, report),
            EventPayload::MachineRelease { run, machine, qty } => {
                self.state.adjust_in_use(machine, -*qty);
                debug!(run = %run, machine = %machine, qty = %qty, "machine released");
                self.journal.record(LogRecord::MachineReleased {
                    time: event.time,
                    run: *run,
                    machine: machine.clone(),
                    qty: *qty,
                });
                Ok(())
            }
            EventPayload::RecipeStepReady { recipe_run } => self.schedule_ready_steps(*recipe_run, report),
        }
    }

    fn on_process_start(
        &mut self,
        event: &SchedulerEvent,
        p: &ProcessPayload,
        report: &mut AdvanceReport,
    ) -> Result<(), SimError> {
        let now = event.time;
        let mut taken: Vec<&Flow> = Vec::with_capacity(p.inputs.len());
        let mut failure = None;
        for flow in &p.inputs {
            let def = self.defs.get_item(&flow.item);
            match self.state.inventory.take(&flow.item, flow.qty, &flow.unit, self.units.as_ref(), def) {
                Ok(()) => taken.push(flow),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            for flow in taken.into_iter().rev() {
                let def = self.defs.get_item(&flow.item);
                if let Err(e) = self.state.inventory.add(&flow.item, flow.qty, &flow.unit, self.units.as_ref(), def) {
                    warn!(item = %flow.item, error = %e, "refund failed");
                }
            }
            // The run never held its machines in use; drop its active entry
            // before the shared cancel path releases anything.
            self.scheduler.cancel_process(p.run);
            self.cancel_run(p.run, &format!("inputs unavailable at start: {error}"));
            if let Some(link) = p.recipe {
                self.orchestrator.unschedule(link.recipe_run, link.step_index);
                self.mark_stalled(link.recipe_run, link.step_index);
            }
            report.cancelled.push(p.run);
            if !p.machines.is_empty() {
                self.wake_waiting_runs(now, p.recipe.map(|link| link.recipe_run))?;
            }
            return Ok(());
        }

        for hold in payload_holds(p) {
            self.state.adjust_in_use(&hold.machine_id, hold.qty_reserved);
        }
        self.state.total_energy_kwh = self.state.total_energy_kwh.saturating_add(p.energy_kwh);
        self.orchestrator.on_event(event, now);
        debug!(run = %p.run, process = %p.process, "process started");
        self.journal.record(LogRecord::ProcessStarted {
            time: now,
            run: p.run,
            inputs: p.inputs.clone(),
            energy_kwh: p.energy_kwh,
        });
        report.started.push(p.run);
        Ok(())
    }

    /// Machines freed by a cancelled run: let every recipe run with stalled
    /// steps try again at `at`, except `skip`.
    fn wake_waiting_runs(&mut self, at: Hours, skip: Option<RecipeRunId>) -> Result<(), SimError> {
        let waiting: Vec<RecipeRunId> = self
            .orchestrator
            .active_runs()
            .filter(|rr| !rr.stalled_steps.is_empty() && Some(rr.recipe_run_id) != skip)
            .map(|rr| rr.recipe_run_id)
            .collect();
        for recipe_run in waiting {
            self.queue_step_ready(recipe_run, at)?;
        }
        Ok(())
    }

    fn on_process_complete(
        &mut self,
        event: &SchedulerEvent,
        p: &ProcessPayload,
        report: &mut AdvanceReport,
    ) -> Result<(), SimError> {
        let now = event.time;
        let mut stock = self.state.inventory.clone();
        for flow in &p.outputs {
            let def = self.defs.get_item(&flow.item);
            stock
                .add(&flow.item, flow.qty, &flow.unit, self.units.as_ref(), def)
                .map_err(|e| SimError::AdvanceFailed(format!("{} cannot stock its output: {e}", p.run)))?;
        }
        self.state.inventory = stock;
        for hold in payload_holds(p).into_iter().filter(|h| !releases_early(h)) {
            self.state.adjust_in_use(&hold.machine_id, -hold.qty_reserved);
        }
        self.reservations.remove_reservation(p.run);
        debug!(run = %p.run, process = %p.process, "process completed");
        self.journal.record(LogRecord::ProcessCompleted {
            time: now,
            run: p.run,
            outputs: p.outputs.clone(),
        });
        report.completed.push(p.run);

        if let Some(StepTransition::Completed { recipe_run, recipe_completed, .. }) =
            self.orchestrator.on_event(event, now)
        {
            if recipe_completed {
                info!(recipe_run = %recipe_run, at = %now, "recipe completed");
                report.recipes_completed.push(recipe_run);
            } else {
                self.schedule_ready_steps(recipe_run, report)?;
            }
        }
        Ok(())
    }

    /// What advancing by `duration` would do, without changing anything.
    ///
    /// The tick is run on a detached copy restored from a snapshot of this
    /// engine, so listeners do not fire.
    pub fn preview_step(&self, duration: Hours) -> Result<Preview, SimError> {
        if duration < Fixed64::ZERO {
            return Err(SimError::AdvanceFailed(format!("negative duration {duration}")));
        }
        let bytes = self.serialize().map_err(|e| SimError::Internal(e.to_string()))?;
        let mut dry = Self::from_snapshot_bytes(&bytes, Arc::clone(&self.defs), Arc::clone(&self.units))
            .map_err(|e| SimError::Internal(e.to_string()))?;
        let report = dry.advance_time(duration)?;
        Ok(Preview {
            from: report.from,
            until: report.to,
            events: report.processed,
            starting: report.started,
            completing: report.completed,
            recipes_completing: report.recipes_completed,
        })
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Flush the journal to the store's log, then write a snapshot.
    pub fn save(&mut self, store: &mut dyn SimStore) -> Result<(), SimError> {
        let sim_id = self.config.sim_id.clone();
        let records = self.journal.drain();
        let count = records.len();
        if let Err(e) = store.append_log(&sim_id, &records) {
            self.journal.restore(records);
            return Err(SimError::Internal(format!("log write failed: {e}")));
        }
        self.journal.mark_flushed(count);
        let bytes = self
            .serialize()
            .map_err(|e| SimError::Internal(e.to_string()))?;
        store
            .write_snapshot(&sim_id, &bytes)
            .map_err(|e| SimError::Internal(format!("snapshot write failed: {e}")))?;
        info!(sim_id = %sim_id, records = count, bytes = bytes.len(), "saved");
        Ok(())
    }

    /// Load `config.sim_id` from a store with the built-in unit table.
    pub fn load(
        config: EngineConfig,
        defs: Arc<dyn DefinitionStore>,
        store: &dyn SimStore,
    ) -> Result<Self, SimError> {
        Self::load_with_units(config, defs, Arc::new(StandardUnits), store)
    }

    /// Load from the latest snapshot if there is one, otherwise rebuild by
    /// replaying the log from the start.
    pub fn load_with_units(
        config: EngineConfig,
        defs: Arc<dyn DefinitionStore>,
        units: Arc<dyn UnitConverter>,
        store: &dyn SimStore,
    ) -> Result<Self, SimError> {
        let sim_id = config.sim_id.clone();
        let log = store
            .read_log(&sim_id)
            .map_err(|e| SimError::Internal(format!("log read failed: {e}")))?;
        let snapshot = store
            .read_snapshot(&sim_id)
            .map_err(|e| SimError::Internal(format!("snapshot read failed: {e}")))?;

        let mut engine = match snapshot {
            Some(bytes) => {
                let engine = Self::from_snapshot_bytes(&bytes, defs, units)
                    .map_err(|e| SimError::Internal(format!("snapshot unreadable: {e}")))?;
                if engine.config.sim_id != sim_id {
                    return Err(SimError::Internal(
                        crate::serialize::DeserializeError::SimIdMismatch {
                            expected: sim_id,
                            found: engine.config.sim_id.clone(),
                        }
                        .to_string(),
                    ));
                }
                if log.last().is_some_and(|r| r.time() > engine.current_time()) {
                    warn!(sim_id = %sim_id, "log has records past the snapshot; snapshot wins");
                }
                info!(sim_id = %sim_id, time = %engine.current_time(), "loaded from snapshot");
                engine
            }
            None => {
                let engine = replay::replay_log(config, defs, units, &log)
                    .map_err(|e| SimError::Internal(format!("replay failed: {e}")))?;
                info!(sim_id = %sim_id, records = log.len(), "rebuilt from log");
                engine
            }
        };
        engine.journal.mark_flushed(log.len());
        Ok(engine)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn definitions(&self) -> Arc<dyn DefinitionStore> {
        Arc::clone(&self.defs)
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn current_time(&self) -> Hours {
        self.scheduler.current_time()
    }

    pub fn inventory_of(&self, item: &ItemId) -> Option<&InventoryEntry> {
        self.state.inventory.get(item)
    }

    /// Held quantity of `item` in `unit`; zero if not held.
    pub fn quantity_of(&self, item: &ItemId, unit: &str) -> Result<Quantity, SimError> {
        self.state
            .inventory
            .available(item, unit, self.units.as_ref(), self.defs.get_item(item))
            .map_err(|e| SimError::validation(vec![RuleViolation::new("convertible_unit", e.to_string())]))
    }

    pub fn active_processes(&self) -> impl Iterator<Item = &ProcessRun> {
        self.scheduler.active()
    }

    pub fn completed_processes(&self) -> &[ProcessRun] {
        self.scheduler.completed()
    }

    pub fn recipe_run(&self, id: RecipeRunId) -> Option<&RecipeRun> {
        self.orchestrator.get(id)
    }

    pub fn recipe_runs(&self) -> impl Iterator<Item = &RecipeRun> {
        self.orchestrator.runs()
    }

    pub fn pending_events(&self) -> impl Iterator<Item = &SchedulerEvent> {
        self.scheduler.pending()
    }

    pub fn reservations(&self) -> &[Reservation] {
        self.reservations.reservations()
    }

    /// Per-machine quantity held by reservations not yet released.
    pub fn in_flight_reservations(&self) -> BTreeMap<MachineId, Quantity> {
        self.reservations.in_flight_totals(self.current_time())
    }

    pub fn utilization(&self, machine: &MachineId, t0: Hours, t1: Hours) -> Fixed64 {
        self.reservations.get_utilization(machine, t0, t1)
    }

    /// One hash over every replay-stable subsystem.
    pub fn state_hash(&self) -> u64 {
        self.subsystem_hashes().combined()
    }

    /// Records not yet written to a store.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn counters(&self) -> IdCounters {
        self.counters
    }
}

fn shortfall_from(error: InventoryError, item: &ItemId, needed: Quantity, unit: &str) -> Shortfall {
    let available = match error {
        InventoryError::Insufficient { available, .. } => available,
        InventoryError::Conversion { .. } | InventoryError::Overflow { .. } => {
            warn!(item = %item, unit, error = %error, "held stock not comparable");
            Fixed64::ZERO
        }
    };
    Shortfall {
        item: item.clone(),
        needed,
        available,
        unit: unit.to_string(),
    }
}

fn stock_violation(error: &InventoryError) -> RuleViolation {
    let rule = match error {
        InventoryError::Overflow { .. } => "quantity_overflow",
        _ => "convertible_unit",
    };
    RuleViolation::new(rule, error.to_string())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Outcome;
    use crate::test_utils::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ore() -> ItemId {
        ItemId::new("ore")
    }

    fn smelt() -> ProcessRequest {
        ProcessRequest::new(ProcessId::new("smelt"))
    }

    // -----------------------------------------------------------------------
    // Test 1: Imports
    // -----------------------------------------------------------------------
    #[test]
    fn import_unknown_item_is_kb_gap() {
        let mut engine = smelting_engine("imports");
        let err = engine.import_item(&ItemId::new("unobtainium"), fx(1.0), "kg").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KbGap);
    }

    #[test]
    fn import_rejects_non_positive_quantity() {
        let mut engine = smelting_engine("imports");
        let err = engine.import_item(&ore(), fx(0.0), "kg").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(engine.inventory_of(&ore()).is_none());
    }

    #[test]
    fn import_converts_into_held_unit() {
        let mut engine = smelting_engine("imports");
        engine.import_item(&ore(), fx(1.0), "t").unwrap();
        engine.import_item(&ore(), fx(500.0), "kg").unwrap();
        let entry = engine.inventory_of(&ore()).unwrap();
        assert_eq!(entry.unit, "t");
        assert_eq!(entry.quantity, fx(1.5));
        assert_eq!(engine.state().total_imports.get(&ore()).unwrap().quantity, fx(1.5));
    }

    #[test]
    fn import_overflow_is_a_validation_error() {
        let mut engine = smelting_engine("imports");
        engine.import_item(&ore(), fx(2.0e9), "kg").unwrap();
        let before = engine.state_hash();
        let err = engine.import_item(&ore(), fx(2.0e9), "kg").unwrap_err();
        match &err {
            SimError::Validation { violations } => assert_eq!(violations[0].rule, "quantity_overflow"),
            other => panic!("expected validation_error, got {other:?}"),
        }
        assert_eq!(engine.state_hash(), before);
        assert_eq!(engine.inventory_of(&ore()).unwrap().quantity, fx(2.0e9));
    }

    #[test]
    fn machine_capacity_overflow_changes_nothing() {
        let mut engine = smelting_engine("imports");
        let furnace = MachineId::new("furnace");
        engine.state.machines_built.insert(furnace.clone(), fx(2.0e9));
        let err = engine.import_item(&ItemId::new("furnace"), fx(2.0e9), "count").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(engine.inventory_of(&ItemId::new("furnace")).is_none());
        assert_eq!(engine.state().machines_built_of(&furnace), fx(2.0e9));
    }

    #[test]
    fn import_in_a_foreign_unit_is_rejected() {
        let mut engine = smelting_engine("imports");
        let iron = ItemId::new("iron");
        let err = engine.import_item(&iron, fx(1.0), "L").unwrap_err();
        match &err {
            SimError::Validation { violations } => assert_eq!(violations[0].rule, "convertible_unit"),
            other => panic!("expected validation_error, got {other:?}"),
        }
        assert!(engine.inventory_of(&iron).is_none());
        assert!(engine.journal().pending().is_empty());
    }

    #[test]
    fn import_of_machine_raises_capacity() {
        let mut engine = smelting_engine("imports");
        let furnace = MachineId::new("furnace");
        engine.import_item(&ItemId::new("furnace"), fx(2.0), "count").unwrap();
        assert_eq!(engine.state().machines_built_of(&furnace), fx(2.0));
        assert_eq!(engine.reservations.capacity(&furnace), fx(2.0));
    }

    // -----------------------------------------------------------------------
    // Test 2: Building machines
    // -----------------------------------------------------------------------
    #[test]
    fn build_consumes_bom_and_adds_capacity() {
        let mut engine = smelting_engine("build");
        let iron = ItemId::new("iron");
        engine.import_item(&iron, fx(12.0), "kg").unwrap();
        engine.build_machine(&MachineId::new("furnace"), fx(2.0)).unwrap();
        assert_eq!(engine.inventory_of(&iron).unwrap().quantity, fx(2.0));
        assert_eq!(engine.state().machines_built_of(&MachineId::new("furnace")), fx(2.0));
    }

    #[test]
    fn build_shortfall_changes_nothing() {
        let mut engine = smelting_engine("build");
        let iron = ItemId::new("iron");
        engine.import_item(&iron, fx(4.0), "kg").unwrap();
        let before = engine.state_hash();
        let err = engine.build_machine(&MachineId::new("furnace"), fx(1.0)).unwrap_err();
        match err {
            SimError::InsufficientInputs { shortfalls } => {
                assert_eq!(shortfalls.len(), 1);
                assert_eq!(shortfalls[0].needed, fx(5.0));
                assert_eq!(shortfalls[0].available, fx(4.0));
            }
            other => panic!("expected insufficient_inputs, got {other:?}"),
        }
        assert_eq!(engine.state_hash(), before);
    }

    #[test]
    fn build_of_non_machine_is_kb_gap() {
        let mut engine = smelting_engine("build");
        let err = engine.build_machine(&MachineId::new("ore"), fx(1.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KbGap);
    }

    // -----------------------------------------------------------------------
    // Test 3: A batch run completes on time
    // -----------------------------------------------------------------------
    #[test]
    fn batch_run_completes_after_its_duration() {
        let mut engine = ready_engine("batch");
        let run = engine.start_process(smelt()).unwrap();

        let report = engine.advance_time(fx(2.0)).unwrap();
        assert_eq!(report.started, vec![run]);
        assert_eq!(report.completed, vec![run]);
        assert_eq!(engine.completed_processes().len(), 1);
        assert_eq!(engine.completed_processes()[0].end_time, fx(2.0));
        assert_eq!(engine.active_processes().count(), 0);
        assert_eq!(engine.inventory_of(&ore()).unwrap().quantity, fx(9.0));
        assert_eq!(engine.inventory_of(&ItemId::new("iron")).unwrap().quantity, fx(0.5));
        assert_eq!(engine.state().total_energy_kwh, fx(3.0));
        assert_eq!(engine.state().machines_in_use_of(&MachineId::new("furnace")), Fixed64::ZERO);
        assert!(engine.reservations().is_empty());
    }

    #[test]
    fn inputs_are_consumed_at_start_not_at_scheduling() {
        let mut engine = ready_engine("consume");
        engine.start_process(smelt().at(fx(1.0))).unwrap();
        assert_eq!(engine.inventory_of(&ore()).unwrap().quantity, fx(10.0));
        engine.advance_time(fx(1.0)).unwrap();
        assert_eq!(engine.inventory_of(&ore()).unwrap().quantity, fx(9.0));
        assert_eq!(engine.state().machines_in_use_of(&MachineId::new("furnace")), fx(1.0));
    }

    // -----------------------------------------------------------------------
    // Test 4: start_process failures leave state untouched
    // -----------------------------------------------------------------------
    #[test]
    fn unknown_process_is_kb_gap() {
        let mut engine = ready_engine("fail");
        let err = engine.start_process(ProcessRequest::new(ProcessId::new("teleport"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KbGap);
    }

    #[test]
    fn insufficient_inputs_mutate_nothing() {
        let mut engine = ready_engine("fail");
        let before = engine.state_hash();
        let err = engine
            .start_process(smelt().with_sizing(Sizing::scale(fx(20.0))))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientInputs);
        assert_eq!(engine.state_hash(), before);
        assert_eq!(engine.pending_events().count(), 0);
    }

    #[test]
    fn start_in_the_past_is_rejected() {
        let mut engine = ready_engine("fail");
        engine.advance_time(fx(3.0)).unwrap();
        let err = engine.start_process(smelt().at(fx(1.0))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn missing_duration_formula_is_reported() {
        let mut engine = ready_engine("fail");
        let err = engine
            .start_process(ProcessRequest::new(ProcessId::new("assay")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DurationCalculationFailed);
        assert!(engine
            .start_process(ProcessRequest::new(ProcessId::new("assay")).with_sizing(Sizing::duration(fx(1.0))))
            .is_ok());
    }

    #[test]
    fn unstockable_output_is_refused_up_front() {
        let mut engine = ready_engine("outputs");
        let iron = ItemId::new("iron");
        engine.state.inventory.set(
            iron.clone(),
            InventoryEntry { quantity: fx(1.0), unit: "L".to_string() },
        );
        let before = engine.state_hash();
        let err = engine.start_process(smelt()).unwrap_err();
        match &err {
            SimError::Validation { violations } => assert_eq!(violations[0].rule, "convertible_unit"),
            other => panic!("expected validation_error, got {other:?}"),
        }
        assert_eq!(engine.state_hash(), before);
        assert_eq!(engine.pending_events().count(), 0);
        assert_eq!(engine.inventory_of(&ore()).unwrap().quantity, fx(10.0));
    }

    #[test]
    fn output_overflow_is_refused_up_front() {
        let mut engine = ready_engine("outputs");
        let iron = ItemId::new("iron");
        engine.state.inventory.set(
            iron,
            InventoryEntry { quantity: Fixed64::MAX, unit: "kg".to_string() },
        );
        let err = engine.start_process(smelt()).unwrap_err();
        match &err {
            SimError::Validation { violations } => assert_eq!(violations[0].rule, "quantity_overflow"),
            other => panic!("expected validation_error, got {other:?}"),
        }
        assert_eq!(engine.reservations().len(), 0);
    }

    // -----------------------------------------------------------------------
    // Test 5: Furnace contention A/B/C
    // -----------------------------------------------------------------------
    #[test]
    fn furnace_contention_rejects_only_the_overlap() {
        let mut engine = ready_engine("contention");
        let five_hours = Sizing::duration(fx(5.0));
        let a = engine.start_process(smelt().with_sizing(five_hours.clone())).unwrap();
        let b = engine.start_process(smelt().with_sizing(five_hours.clone()).at(fx(2.0)));
        let c = engine.start_process(smelt().with_sizing(five_hours).at(fx(5.0))).unwrap();

        assert_eq!(a, ProcessRunId(0));
        let err = b.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MachineConflict);
        assert_eq!(Outcome::from_result::<()>(&Err(err)).error, Some(ErrorKind::MachineConflict));
        assert_eq!(c, ProcessRunId(1));
        assert_eq!(engine.reservations().len(), 2);
    }

    // -----------------------------------------------------------------------
    // Test 6: Material substitution
    // -----------------------------------------------------------------------
    #[test]
    fn substitute_covers_missing_input() {
        let mut engine = smelting_engine("substitute");
        engine.import_item(&ItemId::new("rich_ore"), fx(2.0), "kg").unwrap();
        engine.import_item(&ItemId::new("furnace"), fx(1.0), "count").unwrap();
        let run = engine.start_process(smelt()).unwrap();
        let payload_items: Vec<ItemId> = engine
            .pending_events()
            .find_map(|e| match &e.payload {
                EventPayload::ProcessStart(p) if p.run == run => Some(p.inputs.iter().map(|f| f.item.clone()).collect()),
                _ => None,
            })
            .unwrap();
        assert_eq!(payload_items, vec![ItemId::new("rich_ore")]);
        engine.advance_time(fx(2.0)).unwrap();
        assert_eq!(engine.inventory_of(&ItemId::new("rich_ore")).unwrap().quantity, fx(1.0));
    }

    #[test]
    fn substitution_can_be_disabled() {
        let mut config = EngineConfig::with_sim_id("no-substitute");
        config.allow_material_substitution = false;
        let mut engine = SimulationEngine::new(config, Arc::new(smelting_registry()));
        engine.import_item(&ItemId::new("rich_ore"), fx(2.0), "kg").unwrap();
        engine.import_item(&ItemId::new("furnace"), fx(1.0), "count").unwrap();
        let err = engine.start_process(smelt()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientInputs);
    }

    // -----------------------------------------------------------------------
    // Test 7: A sibling takes the inputs first
    // -----------------------------------------------------------------------
    #[test]
    fn start_shortfall_cancels_the_later_run() {
        let mut engine = smelting_engine("sibling");
        engine.import_item(&ore(), fx(1.0), "kg").unwrap();
        engine.import_item(&ItemId::new("furnace"), fx(2.0), "count").unwrap();
        let first = engine.start_process(smelt()).unwrap();
        let second = engine.start_process(smelt()).unwrap();

        let report = engine.advance_time(fx(1.0)).unwrap();
        assert_eq!(report.started, vec![first]);
        assert_eq!(report.cancelled, vec![second]);
        assert_eq!(engine.active_processes().count(), 1);
        assert_eq!(engine.reservations.reservations_for(second).count(), 0);
        assert!(!engine.pending_events().any(|e| e.payload.run() == Some(second)));
        assert_eq!(engine.state().machines_in_use_of(&MachineId::new("furnace")), fx(1.0));
        assert_eq!(engine.inventory_of(&ore()).unwrap().quantity, Fixed64::ZERO);
    }

    #[test]
    fn cancelled_start_wakes_a_waiting_recipe() {
        let mut engine = smelting_engine("wake");
        engine.import_item(&ItemId::new("rich_ore"), fx(1.0), "kg").unwrap();
        engine.import_item(&ItemId::new("furnace"), fx(1.0), "count").unwrap();
        engine.import_item(&ItemId::new("press"), fx(1.0), "count").unwrap();

        // Both draw on rich_ore through substitution; the assay leaves too
        // little for the smelt.
        let doomed = engine.start_process(smelt().at(fx(1.0))).unwrap();
        engine
            .start_process(
                ProcessRequest::new(ProcessId::new("assay"))
                    .with_sizing(Sizing::duration(fx(0.5))),
            )
            .unwrap();
        engine.import_item(&ore(), fx(1.0), "kg").unwrap();
        let id = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
        assert!(engine.recipe_run(id).unwrap().stalled_steps.contains(&0));

        let report = engine.advance_time(fx(1.0)).unwrap();
        assert_eq!(report.cancelled, vec![doomed]);
        let rr = engine.recipe_run(id).unwrap();
        assert!(rr.stalled_steps.is_empty());
        assert!(rr.active_steps.contains_key(&0));
        assert_eq!(engine.inventory_of(&ore()).unwrap().quantity, Fixed64::ZERO);

        engine.advance_time(fx(4.0)).unwrap();
        assert!(engine.recipe_run(id).unwrap().is_completed);
        let rebuilt = replay::replay_log(
            engine.config().clone(),
            engine.definitions(),
            Arc::new(StandardUnits),
            engine.journal().pending(),
        )
        .unwrap();
        assert_eq!(rebuilt.state_hash(), engine.state_hash());
    }

    #[test]
    fn recipe_step_cancelled_at_start_stalls_then_recovers() {
        let mut engine = smelting_engine("sibling_recipe");
        engine.import_item(&ore(), fx(1.0), "kg").unwrap();
        engine.import_item(&ItemId::new("furnace"), fx(2.0), "count").unwrap();
        engine.import_item(&ItemId::new("press"), fx(1.0), "count").unwrap();
        let first = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
        let second = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();

        let report = engine.advance_time(fx(1.0)).unwrap();
        assert_eq!(report.started.len(), 1);
        assert_eq!(report.cancelled.len(), 1);
        let rr = engine.recipe_run(second).unwrap();
        assert!(rr.stalled_steps.contains(&0));
        assert!(rr.scheduled_steps.is_empty());
        assert!(rr.active_steps.is_empty());
        assert!(engine.recipe_run(first).unwrap().active_steps.contains_key(&0));
        assert_eq!(engine.state().machines_in_use_of(&MachineId::new("furnace")), fx(1.0));

        engine.import_item(&ore(), fx(1.0), "kg").unwrap();
        let mut completed = Vec::new();
        for _ in 0..6 {
            completed.extend(engine.advance_time(fx(1.0)).unwrap().recipes_completed);
        }
        assert_eq!(completed, vec![first, second]);
        assert_eq!(engine.inventory_of(&ItemId::new("plate")).unwrap().quantity, fx(2.0));

        let rebuilt = replay::replay_log(
            engine.config().clone(),
            engine.definitions(),
            Arc::new(StandardUnits),
            engine.journal().pending(),
        )
        .unwrap();
        assert_eq!(rebuilt.state_hash(), engine.state_hash());
        assert!(crate::validation::diff_engines(&engine, &rebuilt).is_identical);
    }

    // -----------------------------------------------------------------------
    // Test 8: Tick bookkeeping
    // -----------------------------------------------------------------------
    #[test]
    fn negative_advance_fails() {
        let mut engine = ready_engine("tick");
        let err = engine.advance_time(fx(-1.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdvanceFailed);
        assert_eq!(engine.current_time(), Fixed64::ZERO);
    }

    #[test]
    fn each_advance_logs_one_state_snapshot() {
        let mut engine = ready_engine("tick");
        engine.start_process(smelt()).unwrap();
        engine.advance_time(fx(1.0)).unwrap();
        engine.advance_time(fx(1.0)).unwrap();
        let ticks = engine
            .journal()
            .pending()
            .iter()
            .filter(|r| matches!(r, LogRecord::StateSnapshot { .. }))
            .count();
        assert_eq!(ticks, 2);
        assert_eq!(engine.current_time(), fx(2.0));
        assert_eq!(engine.state().current_time_hours, fx(2.0));
    }

    #[test]
    fn preview_reports_without_mutating() {
        let mut engine = ready_engine("preview");
        let run = engine.start_process(smelt()).unwrap();
        let before = engine.state_hash();
        let preview = engine.preview_step(fx(2.0)).unwrap();
        assert_eq!(preview.starting, vec![run]);
        assert_eq!(preview.completing, vec![run]);
        assert_eq!(preview.events.len(), 2);
        assert!(engine.preview_step(fx(1.0)).unwrap().completing.is_empty());
        assert_eq!(engine.state_hash(), before);
    }

    #[test]
    fn preview_includes_follow_on_recipe_steps() {
        let mut engine = ready_engine("preview_recipe");
        let id = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
        let before = engine.state_hash();
        let pending = engine.pending_events().count();

        let preview = engine.preview_step(fx(4.0)).unwrap();
        assert_eq!(preview.completing.len(), 2);
        assert_eq!(preview.recipes_completing, vec![id]);
        assert_eq!(engine.state_hash(), before);
        assert_eq!(engine.pending_events().count(), pending);
        assert_eq!(engine.current_time(), Fixed64::ZERO);

        let report = engine.advance_time(fx(4.0)).unwrap();
        assert_eq!(report.completed, preview.completing);
    }

    #[test]
    fn listeners_see_completions() {
        let mut engine = ready_engine("listen");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        engine.on_event(
            EventKind::ProcessComplete,
            Box::new(move |e| sink.borrow_mut().push(e.payload.run())),
        );
        let run = engine.start_process(smelt()).unwrap();
        engine.advance_time(fx(5.0)).unwrap();
        assert_eq!(*seen.borrow(), vec![Some(run)]);
    }

    // -----------------------------------------------------------------------
    // Test 9: Recipes
    // -----------------------------------------------------------------------
    #[test]
    fn listeners_see_recipe_steps_before_correlation() {
        let mut engine = ready_engine("listen_recipe");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        engine.on_event(
            EventKind::ProcessStart,
            Box::new(move |e| {
                if let EventPayload::ProcessStart(p) = &e.payload {
                    sink.borrow_mut().push(p.recipe.map(|link| link.step_index));
                }
            }),
        );
        let id = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
        engine.advance_time(fx(2.0)).unwrap();
        assert_eq!(*seen.borrow(), vec![Some(0), Some(1)]);
        assert!(engine.recipe_run(id).unwrap().active_steps.contains_key(&1));
    }

    #[test]
    fn two_step_recipe_runs_in_order() {
        let mut engine = ready_engine("recipe");
        let id = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();

        engine.advance_time(fx(2.0)).unwrap();
        let rr = engine.recipe_run(id).unwrap();
        assert!(rr.completed_steps.contains(&0));
        assert!(rr.active_steps.contains_key(&1) || rr.scheduled_steps.contains_key(&1));

        let report = engine.advance_time(fx(2.0)).unwrap();
        assert_eq!(report.recipes_completed, vec![id]);
        let rr = engine.recipe_run(id).unwrap();
        assert!(rr.is_completed);
        assert_eq!(rr.completed_at, Some(fx(4.0)));
        assert_eq!(engine.inventory_of(&ItemId::new("plate")).unwrap().quantity, fx(1.0));
    }

    #[test]
    fn partial_hold_frees_the_press_early() {
        let mut engine = ready_engine("partial");
        let press = MachineId::new("press");
        let id = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
        engine.advance_time(fx(2.0)).unwrap();
        assert_eq!(engine.state().machines_in_use_of(&press), fx(1.0));

        engine.advance_time(fx(1.0)).unwrap();
        assert_eq!(engine.state().machines_in_use_of(&press), Fixed64::ZERO);
        assert_eq!(engine.reservations.reserved_at(&press, fx(3.0)), Fixed64::ZERO);
        assert!(!engine.recipe_run(id).unwrap().is_completed);
    }

    #[test]
    fn contended_step_stalls_then_retries() {
        let mut engine = ready_engine("stall");
        let first = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
        let second = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
        assert!(engine.recipe_run(second).unwrap().stalled_steps.contains(&0));
        assert!(engine
            .pending_events()
            .any(|e| e.kind() == EventKind::RecipeStepReady && e.time == fx(2.0)));

        engine.advance_time(fx(2.0)).unwrap();
        let rr = engine.recipe_run(second).unwrap();
        assert!(rr.stalled_steps.is_empty());
        assert!(rr.active_steps.contains_key(&0));
        assert!(engine.recipe_run(first).unwrap().completed_steps.contains(&0));

        engine.advance_time(fx(4.0)).unwrap();
        assert!(engine.recipe_run(first).unwrap().is_completed);
        assert!(engine.recipe_run(second).unwrap().is_completed);
        assert_eq!(engine.inventory_of(&ItemId::new("plate")).unwrap().quantity, fx(2.0));
    }

    #[test]
    fn cyclic_recipe_is_a_validation_error() {
        let mut engine = ready_engine("cycle");
        let err = engine.run_recipe(&RecipeId::new("loop")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(engine.recipe_runs().count(), 0);
    }

    #[test]
    fn failing_first_step_aborts_the_recipe() {
        let mut engine = smelting_engine("abort");
        engine.import_item(&ItemId::new("furnace"), fx(1.0), "count").unwrap();
        let err = engine.run_recipe(&RecipeId::new("plate_line")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StepSchedulingFailed);
        match &err {
            SimError::StepSchedulingFailed { step, cause } => {
                assert_eq!(*step, 0);
                assert_eq!(cause.kind(), ErrorKind::InsufficientInputs);
            }
            other => panic!("unexpected {other:?}"),
        }
        let rr = engine.recipe_runs().next().unwrap();
        assert!(rr.cancelled);
        assert_eq!(engine.pending_events().count(), 0);
    }

    #[test]
    fn unknown_recipe_is_kb_gap() {
        let mut engine = ready_engine("gap");
        let err = engine.run_recipe(&RecipeId::new("nothing")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KbGap);
    }
}
