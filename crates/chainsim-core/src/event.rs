//! Time-ordered scheduler events and the queue that holds them.
//!
//! Events are ordered by the explicit key `(time, priority, seq)`. `seq` is a
//! monotonic insertion number assigned by the queue, so two events never
//! compare equal and popping order is fully determined by push order.
//!
//! # Priorities
//!
//! Lower fires first at equal times. A completion (5) fires before a start
//! (10) so a machine freed at T is free for a run starting at T.

use crate::definition::{Flow, MachineRequirement};
use crate::fixed::{Fixed64, Hours, Kwh};
use crate::id::{EventId, ProcessId, ProcessRunId, RecipeRunId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PRIORITY_MACHINE_RELEASE: u32 = 4;
pub const PRIORITY_PROCESS_COMPLETE: u32 = 5;
pub const PRIORITY_PROCESS_START: u32 = 10;
pub const PRIORITY_RECIPE_STEP_READY: u32 = 20;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Discriminant for scheduler events, used for listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ProcessStart,
    ProcessComplete,
    MachineRelease,
    RecipeStepReady,
}

impl EventKind {
    /// Default priority for this kind.
    pub fn default_priority(self) -> u32 {
        match self {
            EventKind::ProcessStart => PRIORITY_PROCESS_START,
            EventKind::ProcessComplete => PRIORITY_PROCESS_COMPLETE,
            EventKind::MachineRelease => PRIORITY_MACHINE_RELEASE,
            EventKind::RecipeStepReady => PRIORITY_RECIPE_STEP_READY,
        }
    }
}

/// Links a process run back to the recipe step that launched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeLink {
    pub recipe_run: RecipeRunId,
    pub step_index: usize,
}

/// Everything needed to start and finish one process run without consulting
/// the definition store again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPayload {
    pub run: ProcessRunId,
    pub process: ProcessId,
    pub scale: Fixed64,
    pub start_time: Hours,
    pub duration_hours: Hours,
    pub inputs: Vec<Flow>,
    pub outputs: Vec<Flow>,
    pub machines: Vec<MachineRequirement>,
    pub energy_kwh: Kwh,
    pub recipe: Option<RecipeLink>,
}

impl ProcessPayload {
    pub fn end_time(&self) -> Hours {
        self.start_time + self.duration_hours
    }
}

/// Typed payload, one variant per event kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    ProcessStart(ProcessPayload),
    ProcessComplete(ProcessPayload),
    /// A partial machine hold ends before its run does.
    MachineRelease {
        run: ProcessRunId,
        machine: crate::id::MachineId,
        qty: Fixed64,
    },
    /// Stalled steps of a recipe run should be retried.
    RecipeStepReady { recipe_run: RecipeRunId },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ProcessStart(_) => EventKind::ProcessStart,
            EventPayload::ProcessComplete(_) => EventKind::ProcessComplete,
            EventPayload::MachineRelease { .. } => EventKind::MachineRelease,
            EventPayload::RecipeStepReady { .. } => EventKind::RecipeStepReady,
        }
    }

    /// The process run this event belongs to, if any.
    pub fn run(&self) -> Option<ProcessRunId> {
        match self {
            EventPayload::ProcessStart(p) | EventPayload::ProcessComplete(p) => Some(p.run),
            EventPayload::MachineRelease { run, .. } => Some(*run),
            EventPayload::RecipeStepReady { .. } => None,
        }
    }
}

/// A queued event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub time: Hours,
    pub event_id: EventId,
    pub priority: u32,
    /// Insertion sequence; assigned by the queue on push.
    pub seq: u64,
    pub payload: EventPayload,
}

impl SchedulerEvent {
    pub fn new(time: Hours, event_id: EventId, priority: u32, payload: EventPayload) -> Self {
        Self { time, event_id, priority, seq: 0, payload }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn key(&self) -> EventKey {
        EventKey { time: self.time, priority: self.priority, seq: self.seq }
    }
}

/// Total ordering key of a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub time: Hours,
    pub priority: u32,
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("event id already queued: {0}")]
    DuplicateId(EventId),
}

/// Time-ordered queue of pending events with removal by id.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    events: BTreeMap<EventKey, SchedulerEvent>,
    index: BTreeMap<EventId, EventKey>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from persisted events, keeping their sequence numbers.
    pub fn from_parts(events: Vec<SchedulerEvent>, next_seq: u64) -> Result<Self, QueueError> {
        let mut queue = Self { next_seq, ..Self::default() };
        for event in events {
            if queue.index.contains_key(&event.event_id) {
                return Err(QueueError::DuplicateId(event.event_id));
            }
            queue.next_seq = queue.next_seq.max(event.seq + 1);
            queue.index.insert(event.event_id.clone(), event.key());
            queue.events.insert(event.key(), event);
        }
        Ok(queue)
    }

    /// Push an event, assigning its sequence number. Returns the sequence.
    pub fn push(&mut self, mut event: SchedulerEvent) -> Result<u64, QueueError> {
        if self.index.contains_key(&event.event_id) {
            return Err(QueueError::DuplicateId(event.event_id));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        event.seq = seq;
        self.index.insert(event.event_id.clone(), event.key());
        self.events.insert(event.key(), event);
        Ok(seq)
    }

    pub fn pop(&mut self) -> Option<SchedulerEvent> {
        let (_, event) = self.events.pop_first()?;
        self.index.remove(&event.event_id);
        Some(event)
    }

    pub fn peek(&self) -> Option<&SchedulerEvent> {
        self.events.values().next()
    }

    /// Remove a pending event by id.
    pub fn remove(&mut self, id: &EventId) -> Option<SchedulerEvent> {
        let key = self.index.remove(id)?;
        self.events.remove(&key)
    }

    /// Remove every pending event matching `pred`. Returns them in
    /// queue order.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<SchedulerEvent>
    where
        F: FnMut(&SchedulerEvent) -> bool,
    {
        let keys: Vec<EventKey> = self
            .events
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|k| {
                let event = self.events.remove(&k)?;
                self.index.remove(&event.event_id);
                Some(event)
            })
            .collect()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Pending events in firing order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &SchedulerEvent> {
        self.events.values()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MachineId;

    fn fx(v: f64) -> Fixed64 {
        Fixed64::from_num(v)
    }

    fn release(time: f64, run: u64, priority: u32) -> SchedulerEvent {
        let run = ProcessRunId(run);
        let machine = MachineId::new("press");
        SchedulerEvent::new(
            fx(time),
            EventId::release(run, &machine),
            priority,
            EventPayload::MachineRelease { run, machine, qty: Fixed64::ONE },
        )
    }

    // -----------------------------------------------------------------------
    // Test 1: Pops in time order
    // -----------------------------------------------------------------------
    #[test]
    fn pops_in_time_order() {
        let mut q = EventQueue::new();
        q.push(release(3.0, 1, 5)).unwrap();
        q.push(release(1.0, 2, 5)).unwrap();
        q.push(release(2.0, 3, 5)).unwrap();
        let times: Vec<Fixed64> = std::iter::from_fn(|| q.pop()).map(|e| e.time).collect();
        assert_eq!(times, vec![fx(1.0), fx(2.0), fx(3.0)]);
    }

    // -----------------------------------------------------------------------
    // Test 2: Priority breaks ties, then insertion order
    // -----------------------------------------------------------------------
    #[test]
    fn priority_then_sequence_break_ties() {
        let mut q = EventQueue::new();
        q.push(release(1.0, 1, PRIORITY_PROCESS_START)).unwrap();
        q.push(release(1.0, 2, PRIORITY_PROCESS_COMPLETE)).unwrap();
        q.push(release(1.0, 3, PRIORITY_PROCESS_COMPLETE)).unwrap();
        let runs: Vec<Option<ProcessRunId>> =
            std::iter::from_fn(|| q.pop()).map(|e| e.payload.run()).collect();
        assert_eq!(
            runs,
            vec![Some(ProcessRunId(2)), Some(ProcessRunId(3)), Some(ProcessRunId(1))]
        );
    }

    // -----------------------------------------------------------------------
    // Test 3: Remove by id
    // -----------------------------------------------------------------------
    #[test]
    fn remove_by_id() {
        let mut q = EventQueue::new();
        let e = release(1.0, 1, 5);
        let id = e.event_id.clone();
        q.push(e).unwrap();
        q.push(release(2.0, 2, 5)).unwrap();
        assert!(q.remove(&id).is_some());
        assert!(q.remove(&id).is_none());
        assert_eq!(q.len(), 1);
        assert!(!q.contains(&id));
    }

    // -----------------------------------------------------------------------
    // Test 4: Duplicate ids are rejected
    // -----------------------------------------------------------------------
    #[test]
    fn duplicate_ids_rejected() {
        let mut q = EventQueue::new();
        q.push(release(1.0, 1, 5)).unwrap();
        assert!(matches!(q.push(release(2.0, 1, 5)), Err(QueueError::DuplicateId(_))));
        assert_eq!(q.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Test 5: Rebuild keeps order and sequence counter
    // -----------------------------------------------------------------------
    #[test]
    fn rebuild_from_parts() {
        let mut q = EventQueue::new();
        q.push(release(2.0, 1, 5)).unwrap();
        q.push(release(1.0, 2, 5)).unwrap();
        let events: Vec<SchedulerEvent> = q.iter_ordered().cloned().collect();
        let mut rebuilt = EventQueue::from_parts(events, q.next_seq()).unwrap();
        assert_eq!(rebuilt.next_seq(), 2);
        assert_eq!(rebuilt.pop().unwrap().payload.run(), Some(ProcessRunId(2)));
    }

    // -----------------------------------------------------------------------
    // Test 6: remove_where drops a run's events only
    // -----------------------------------------------------------------------
    #[test]
    fn remove_where_filters() {
        let mut q = EventQueue::new();
        q.push(release(1.0, 1, 5)).unwrap();
        q.push(release(2.0, 2, 5)).unwrap();
        let removed = q.remove_where(|e| e.event_id.belongs_to(ProcessRunId(1)));
        assert_eq!(removed.len(), 1);
        assert_eq!(q.len(), 1);
    }
}
