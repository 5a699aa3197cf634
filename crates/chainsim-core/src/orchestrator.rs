//! Recipe-run bookkeeping.
//!
//! The orchestrator tracks each recipe run's steps through
//! scheduled -> active -> completed by reading scheduler events. It never
//! schedules anything itself; deciding what to start, and whether machines
//! allow it, is the engine's job.

use crate::definition::RecipeDef;
use crate::dependency::DependencyGraph;
use crate::event::{EventPayload, SchedulerEvent};
use crate::fixed::Hours;
use crate::id::{ItemId, ProcessRunId, RecipeId, RecipeRunId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One execution of a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeRun {
    pub recipe_run_id: RecipeRunId,
    pub recipe_id: RecipeId,
    pub target_item_id: ItemId,
    /// Definition as it was when the run began.
    pub recipe: RecipeDef,
    pub graph: DependencyGraph,
    pub started_at: Hours,
    pub completed_steps: BTreeSet<usize>,
    pub active_steps: BTreeMap<usize, ProcessRunId>,
    pub scheduled_steps: BTreeMap<usize, ProcessRunId>,
    /// Ready steps waiting for a machine.
    pub stalled_steps: BTreeSet<usize>,
    pub is_completed: bool,
    pub completed_at: Option<Hours>,
    pub cancelled: bool,
}

impl RecipeRun {
    pub fn new(
        recipe_run_id: RecipeRunId,
        recipe: RecipeDef,
        graph: DependencyGraph,
        started_at: Hours,
    ) -> Self {
        Self {
            recipe_run_id,
            recipe_id: recipe.id.clone(),
            target_item_id: recipe.target_item.clone(),
            recipe,
            graph,
            started_at,
            completed_steps: BTreeSet::new(),
            active_steps: BTreeMap::new(),
            scheduled_steps: BTreeMap::new(),
            stalled_steps: BTreeSet::new(),
            is_completed: false,
            completed_at: None,
            cancelled: false,
        }
    }

    pub fn total_steps(&self) -> usize {
        self.graph.len()
    }

    /// Steps that may be scheduled now: dependencies met, not yet scheduled,
    /// active or completed. Includes stalled steps.
    pub fn ready_steps(&self) -> Vec<usize> {
        if self.cancelled || self.is_completed {
            return Vec::new();
        }
        let excluded: BTreeSet<usize> = self
            .scheduled_steps
            .keys()
            .chain(self.active_steps.keys())
            .copied()
            .collect();
        self.graph.ready_steps(&self.completed_steps, &excluded)
    }

    /// Process runs belonging to this recipe run that have not completed.
    pub fn in_flight(&self) -> Vec<ProcessRunId> {
        self.scheduled_steps
            .values()
            .chain(self.active_steps.values())
            .copied()
            .collect()
    }
}

/// What an event did to a recipe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTransition {
    Activated { recipe_run: RecipeRunId, step: usize },
    Completed { recipe_run: RecipeRunId, step: usize, recipe_completed: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeOrchestrator {
    runs: BTreeMap<RecipeRunId, RecipeRun>,
}

impl RecipeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, run: RecipeRun) {
        self.runs.insert(run.recipe_run_id, run);
    }

    pub fn get(&self, id: RecipeRunId) -> Option<&RecipeRun> {
        self.runs.get(&id)
    }

    pub fn runs(&self) -> impl Iterator<Item = &RecipeRun> {
        self.runs.values()
    }

    /// Runs neither completed nor cancelled.
    pub fn active_runs(&self) -> impl Iterator<Item = &RecipeRun> {
        self.runs.values().filter(|r| !r.is_completed && !r.cancelled)
    }

    pub fn mark_scheduled(&mut self, id: RecipeRunId, step: usize, run: ProcessRunId) {
        if let Some(rr) = self.runs.get_mut(&id) {
            rr.stalled_steps.remove(&step);
            rr.scheduled_steps.insert(step, run);
        }
    }

    pub fn mark_stalled(&mut self, id: RecipeRunId, step: usize) {
        if let Some(rr) = self.runs.get_mut(&id) {
            rr.stalled_steps.insert(step);
        }
    }

    /// Forget a step's process run, returning the step to not-started.
    pub fn unschedule(&mut self, id: RecipeRunId, step: usize) {
        if let Some(rr) = self.runs.get_mut(&id) {
            rr.scheduled_steps.remove(&step);
            rr.active_steps.remove(&step);
        }
    }

    /// Mark a run cancelled. Returns the process runs it still had in
    /// flight, for the caller to cancel.
    pub fn cancel_run(&mut self, id: RecipeRunId) -> Vec<ProcessRunId> {
        let Some(rr) = self.runs.get_mut(&id) else {
            return Vec::new();
        };
        let in_flight = rr.in_flight();
        rr.scheduled_steps.clear();
        rr.active_steps.clear();
        rr.stalled_steps.clear();
        rr.cancelled = true;
        in_flight
    }

    /// Steps of a run that are ready to schedule.
    pub fn newly_ready(&self, id: RecipeRunId) -> Vec<usize> {
        self.runs.get(&id).map(RecipeRun::ready_steps).unwrap_or_default()
    }

    /// Apply a scheduler event. Events that do not belong to a recipe step
    /// are ignored.
    pub fn on_event(&mut self, event: &SchedulerEvent, now: Hours) -> Option<StepTransition> {
        let (payload, starting) = match &event.payload {
            EventPayload::ProcessStart(p) => (p, true),
            EventPayload::ProcessComplete(p) => (p, false),
            _ => return None,
        };
        let link = payload.recipe?;
        let rr = self.runs.get_mut(&link.recipe_run)?;
        let step = link.step_index;

        if starting {
            if rr.scheduled_steps.get(&step) != Some(&payload.run) {
                return None;
            }
            rr.scheduled_steps.remove(&step);
            rr.active_steps.insert(step, payload.run);
            Some(StepTransition::Activated { recipe_run: link.recipe_run, step })
        } else {
            if rr.active_steps.get(&step) != Some(&payload.run) {
                return None;
            }
            rr.active_steps.remove(&step);
            rr.completed_steps.insert(step);
            if rr.completed_steps.len() == rr.total_steps() {
                rr.is_completed = true;
                rr.completed_at = Some(now);
            }
            Some(StepTransition::Completed {
                recipe_run: link.recipe_run,
                step,
                recipe_completed: rr.is_completed,
            })
        }
    }

    /// Restore a step straight into a state. Used by log replay.
    pub fn restore_step_active(&mut self, id: RecipeRunId, step: usize, run: ProcessRunId) {
        if let Some(rr) = self.runs.get_mut(&id) {
            rr.scheduled_steps.remove(&step);
            rr.active_steps.insert(step, run);
        }
    }

    pub fn restore_step_completed(&mut self, id: RecipeRunId, step: usize, at: Hours) {
        if let Some(rr) = self.runs.get_mut(&id) {
            rr.scheduled_steps.remove(&step);
            rr.active_steps.remove(&step);
            rr.completed_steps.insert(step);
            if rr.completed_steps.len() == rr.total_steps() {
                rr.is_completed = true;
                rr.completed_at = Some(at);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
