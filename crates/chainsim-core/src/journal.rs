//! Append-only lifecycle log.
//!
//! One record per import, build, recipe start, step stall, retry, process
//! schedule, start, release, completion, cancellation and tick. Records
//! carry enough data to rebuild engine state without consulting the
//! definition store's rules again.

use crate::definition::{Flow, RecipeDef};
use crate::event::ProcessPayload;
use crate::fixed::{Hours, Kwh, Quantity};
use crate::id::{ItemId, MachineId, ProcessRunId, RecipeRunId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    Import {
        time: Hours,
        item: ItemId,
        qty: Quantity,
        unit: String,
        /// Units added to machine capacity, for machine items.
        machine_units: Option<Quantity>,
    },
    Build {
        time: Hours,
        machine: MachineId,
        count: Quantity,
        consumed: Vec<Flow>,
    },
    RecipeStarted {
        time: Hours,
        recipe_run: RecipeRunId,
        recipe: RecipeDef,
    },
    RecipeCancelled {
        time: Hours,
        recipe_run: RecipeRunId,
    },
    /// A ready recipe step could not be scheduled and is waiting.
    StepStalled {
        time: Hours,
        recipe_run: RecipeRunId,
        step: usize,
    },
    /// A retry of a run's stalled steps was queued for `at`.
    RetryScheduled {
        time: Hours,
        recipe_run: RecipeRunId,
        attempt: u64,
        at: Hours,
    },
    ProcessScheduled {
        time: Hours,
        payload: ProcessPayload,
    },
    ProcessStarted {
        time: Hours,
        run: ProcessRunId,
        inputs: Vec<Flow>,
        energy_kwh: Kwh,
    },
    MachineReleased {
        time: Hours,
        run: ProcessRunId,
        machine: MachineId,
        qty: Quantity,
    },
    ProcessCompleted {
        time: Hours,
        run: ProcessRunId,
        /// Output lines actually added; a line that failed conversion is
        /// absent.
        outputs: Vec<Flow>,
    },
    ProcessCancelled {
        time: Hours,
        run: ProcessRunId,
        reason: String,
    },
    StateSnapshot {
        time: Hours,
        state_hash: u64,
        active_processes: usize,
        pending_events: usize,
    },
}

impl LogRecord {
    pub fn time(&self) -> Hours {
        match self {
            LogRecord::Import { time, .. }
            | LogRecord::Build { time, .. }
            | LogRecord::RecipeStarted { time, .. }
            | LogRecord::RecipeCancelled { time, .. }
            | LogRecord::StepStalled { time, .. }
            | LogRecord::RetryScheduled { time, .. }
            | LogRecord::ProcessScheduled { time, .. }
            | LogRecord::ProcessStarted { time, .. }
            | LogRecord::MachineReleased { time, .. }
            | LogRecord::ProcessCompleted { time, .. }
            | LogRecord::ProcessCancelled { time, .. }
            | LogRecord::StateSnapshot { time, .. } => *time,
        }
    }
}

/// Buffer of records not yet written to a store.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    buffer: Vec<LogRecord>,
    flushed: usize,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: LogRecord) {
        self.buffer.push(record);
    }

    pub fn pending(&self) -> &[LogRecord] {
        &self.buffer
    }

    /// Take the buffered records. Call [`Journal::mark_flushed`] once they
    /// are durable.
    pub fn drain(&mut self) -> Vec<LogRecord> {
        std::mem::take(&mut self.buffer)
    }

    /// Put records back at the front after a failed write.
    pub fn restore(&mut self, mut records: Vec<LogRecord>) {
        records.append(&mut self.buffer);
        self.buffer = records;
    }

    pub fn mark_flushed(&mut self, count: usize) {
        self.flushed += count;
    }

    /// Records written to a store so far.
    pub fn flushed(&self) -> usize {
        self.flushed
    }
}
