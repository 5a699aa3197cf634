//! The scheduler owns the event queue and the process-run registries.
//!
//! [`Scheduler::advance_to`] is the tick: it pops every event due at or
//! before the target, strictly in `(time, priority, seq)` order, runs the
//! internal handler for the event's kind and then any listeners registered
//! for that kind. [`Scheduler::process_next`] is the single-event step that
//! `advance_to` loops over; callers that schedule new events while handling
//! one drive it directly so those events still fire within the same tick.

use crate::definition::{Flow, MachineRequirement};
use crate::event::{
    EventKind, EventPayload, EventQueue, ProcessPayload, QueueError, RecipeLink, SchedulerEvent,
};
use crate::fixed::{Fixed64, Hours, Kwh};
use crate::id::{EventId, ProcessId, ProcessRunId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("cannot schedule at {time} before current time {now}")]
    RetroactiveEvent { time: Hours, now: Hours },
    #[error("cannot advance to {target} before current time {now}")]
    TargetInPast { target: Hours, now: Hours },
    #[error("completion for {0} has no active run")]
    UnknownRun(ProcessRunId),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// One execution of a process. Created when its START fires; frozen once
/// its COMPLETE fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRun {
    pub process_run_id: ProcessRunId,
    pub process_id: ProcessId,
    pub start_time: Hours,
    pub duration_hours: Hours,
    pub end_time: Hours,
    pub scale: Fixed64,
    pub inputs_consumed: Vec<Flow>,
    pub outputs_pending: Vec<Flow>,
    pub machines_reserved: Vec<MachineRequirement>,
    pub recipe: Option<RecipeLink>,
    pub energy_kwh: Option<Kwh>,
}

impl ProcessRun {
    pub fn from_payload(p: &ProcessPayload) -> Self {
        Self {
            process_run_id: p.run,
            process_id: p.process.clone(),
            start_time: p.start_time,
            duration_hours: p.duration_hours,
            end_time: p.end_time(),
            scale: p.scale,
            inputs_consumed: p.inputs.clone(),
            outputs_pending: p.outputs.clone(),
            machines_reserved: p.machines.clone(),
            recipe: p.recipe,
            energy_kwh: None,
        }
    }
}

/// Per-kind event priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Priorities {
    pub process_start: u32,
    pub process_complete: u32,
    pub machine_release: u32,
    pub recipe_step_ready: u32,
}

impl Default for Priorities {
    fn default() -> Self {
        Self {
            process_start: EventKind::ProcessStart.default_priority(),
            process_complete: EventKind::ProcessComplete.default_priority(),
            machine_release: EventKind::MachineRelease.default_priority(),
            recipe_step_ready: EventKind::RecipeStepReady.default_priority(),
        }
    }
}

impl Priorities {
    pub fn of(&self, kind: EventKind) -> u32 {
        match kind {
            EventKind::ProcessStart => self.process_start,
            EventKind::ProcessComplete => self.process_complete,
            EventKind::MachineRelease => self.machine_release,
            EventKind::RecipeStepReady => self.recipe_step_ready,
        }
    }
}

/// Read-only callback invoked after an event's internal handler.
pub type EventListener = Box<dyn FnMut(&SchedulerEvent)>;

/// Serializable scheduler state. Listeners are not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub current_time: Hours,
    pub pending: Vec<SchedulerEvent>,
    pub next_seq: u64,
    pub active: Vec<ProcessRun>,
    pub completed: Vec<ProcessRun>,
    pub priorities: Priorities,
    pub processed_count: u64,
}

pub struct Scheduler {
    current_time: Hours,
    queue: EventQueue,
    active: BTreeMap<ProcessRunId, ProcessRun>,
    completed: Vec<ProcessRun>,
    priorities: Priorities,
    listeners: BTreeMap<EventKind, Vec<EventListener>>,
    processed_count: u64,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("current_time", &self.current_time)
            .field("pending", &self.queue.len())
            .field("active", &self.active.len())
            .field("completed", &self.completed.len())
            .finish()
    }
}

impl Scheduler {
    pub fn new(start_time: Hours) -> Self {
        Self::with_priorities(start_time, Priorities::default())
    }

    pub fn with_priorities(start_time: Hours, priorities: Priorities) -> Self {
        Self {
            current_time: start_time,
            queue: EventQueue::new(),
            active: BTreeMap::new(),
            completed: Vec::new(),
            priorities,
            listeners: BTreeMap::new(),
            processed_count: 0,
        }
    }

    pub fn current_time(&self) -> Hours {
        self.current_time
    }

    pub fn priorities(&self) -> Priorities {
        self.priorities
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Queue an event. Fails if `time` is before the current time.
    pub fn schedule_event(
        &mut self,
        time: Hours,
        event_id: EventId,
        payload: EventPayload,
    ) -> Result<(), SchedulerError> {
        if time < self.current_time {
            return Err(SchedulerError::RetroactiveEvent { time, now: self.current_time });
        }
        let priority = self.priorities.of(payload.kind());
        self.queue.push(SchedulerEvent::new(time, event_id, priority, payload))?;
        Ok(())
    }

    /// Queue the linked START and COMPLETE events for a run. Either both are
    /// queued or neither is.
    pub fn schedule_process_start(&mut self, payload: ProcessPayload) -> Result<(), SchedulerError> {
        let start = payload.start_time;
        if start < self.current_time {
            return Err(SchedulerError::RetroactiveEvent { time: start, now: self.current_time });
        }
        let run = payload.run;
        let end = payload.end_time();
        self.schedule_event(start, EventId::start(run), EventPayload::ProcessStart(payload.clone()))?;
        if let Err(e) =
            self.schedule_event(end, EventId::complete(run), EventPayload::ProcessComplete(payload))
        {
            self.queue.remove(&EventId::start(run));
            return Err(e);
        }
        Ok(())
    }

    /// Drop a run's pending events and its active entry, if started.
    /// Returns the active run that was removed.
    pub fn cancel_process(&mut self, run: ProcessRunId) -> Option<ProcessRun> {
        self.queue.remove_where(|e| e.event_id.belongs_to(run));
        self.active.remove(&run)
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Process the next event if it is due at or before `target`.
    pub fn process_next(&mut self, target: Hours) -> Result<Option<SchedulerEvent>, SchedulerError> {
        match self.queue.peek() {
            Some(e) if e.time <= target => {}
            _ => return Ok(None),
        }
        let Some(event) = self.queue.pop() else {
            return Ok(None);
        };
        self.current_time = self.current_time.max(event.time);
        self.handle(&event)?;
        self.processed_count += 1;
        if let Some(listeners) = self.listeners.get_mut(&event.kind()) {
            for listener in listeners.iter_mut() {
                listener(&event);
            }
        }
        Ok(Some(event))
    }

    /// Process every event due at or before `target`, then move the clock
    /// to `target`. Returns the processed events in order.
    pub fn advance_to(&mut self, target: Hours) -> Result<Vec<SchedulerEvent>, SchedulerError> {
        if target < self.current_time {
            return Err(SchedulerError::TargetInPast { target, now: self.current_time });
        }
        let mut processed = Vec::new();
        while let Some(event) = self.process_next(target)? {
            processed.push(event);
        }
        self.current_time = target;
        Ok(processed)
    }

    /// Move the clock forward without processing. Used once every due
    /// event has been drained by `process_next`.
    pub fn set_time(&mut self, target: Hours) -> Result<(), SchedulerError> {
        if target < self.current_time {
            return Err(SchedulerError::TargetInPast { target, now: self.current_time });
        }
        self.current_time = target;
        Ok(())
    }

    fn handle(&mut self, event: &SchedulerEvent) -> Result<(), SchedulerError> {
        match &event.payload {
            EventPayload::ProcessStart(p) => {
                self.active.insert(p.run, ProcessRun::from_payload(p));
            }
            EventPayload::ProcessComplete(p) => {
                let mut run = self
                    .active
                    .remove(&p.run)
                    .ok_or(SchedulerError::UnknownRun(p.run))?;
                run.energy_kwh = Some(p.energy_kwh);
                self.completed.push(run);
            }
            EventPayload::MachineRelease { .. } | EventPayload::RecipeStepReady { .. } => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Register a listener for one event kind. Listeners run in registration
    /// order after the internal handler.
    pub fn on_event(&mut self, kind: EventKind, listener: EventListener) {
        self.listeners.entry(kind).or_default().push(listener);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn pending(&self) -> impl Iterator<Item = &SchedulerEvent> {
        self.queue.iter_ordered()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_pending(&self, id: &EventId) -> bool {
        self.queue.contains(id)
    }

    pub fn active(&self) -> impl Iterator<Item = &ProcessRun> {
        self.active.values()
    }

    pub fn active_run(&self, run: ProcessRunId) -> Option<&ProcessRun> {
        self.active.get(&run)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed(&self) -> &[ProcessRun] {
        &self.completed
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn to_state(&self) -> SchedulerState {
        SchedulerState {
            current_time: self.current_time,
            pending: self.queue.iter_ordered().cloned().collect(),
            next_seq: self.queue.next_seq(),
            active: self.active.values().cloned().collect(),
            completed: self.completed.clone(),
            priorities: self.priorities,
            processed_count: self.processed_count,
        }
    }

    pub fn from_state(state: SchedulerState) -> Result<Self, SchedulerError> {
        Ok(Self {
            current_time: state.current_time,
            queue: EventQueue::from_parts(state.pending, state.next_seq)?,
            active: state.active.into_iter().map(|r| (r.process_run_id, r)).collect(),
            completed: state.completed,
            priorities: state.priorities,
            listeners: BTreeMap::new(),
            processed_count: state.processed_count,
        })
    }

    /// Restore an already-started run directly into the active registry.
    /// Used by log replay, which never re-runs START handling.
    pub fn restore_active(&mut self, run: ProcessRun) {
        self.active.insert(run.process_run_id, run);
    }

    /// Restore a finished run into the completed history.
    pub fn restore_completed(&mut self, run: ProcessRun) {
        self.active.remove(&run.process_run_id);
        self.completed.push(run);
    }
}
