//! Chainsim Core -- a discrete-event kernel for time-phased production chains.
//!
//! This crate provides typed production definitions, unit conversion,
//! duration and energy formulas, a deterministic event scheduler, machine
//! capacity reservations, recipe orchestration over dependency graphs, and
//! persistence through an append-only journal plus versioned snapshots.
//!
//! # Tick
//!
//! Each call to [`engine::SimulationEngine::advance_time`] moves simulated
//! time forward by a duration:
//!
//! 1. **Retry** -- Recipe steps stalled on a busy machine are tried again.
//! 2. **Drain** -- Every event due at or before the target fires in
//!    `(time, priority, seq)` order; START consumes inputs, COMPLETE adds
//!    outputs and releases machines, MACHINE_RELEASE ends partial holds,
//!    RECIPE_STEP_READY schedules ready steps.
//! 3. **Bookkeeping** -- The clock moves to the target and one tick record
//!    carrying the state hash is journaled.
//!
//! # Scheduling a run
//!
//! ```rust,ignore
//! let run = engine.start_process(
//!     ProcessRequest::new(ProcessId::new("smelt")).with_sizing(Sizing::scale(fx(2.0))),
//! )?;
//! let report = engine.advance_time(fx(4.0))?;
//! assert_eq!(report.completed, vec![run]);
//! ```
//!
//! # Key Types
//!
//! - [`engine::SimulationEngine`] -- Owns all state and is its only writer.
//! - [`scheduler::Scheduler`] -- Event queue plus active and completed runs.
//! - [`reservation::MachineReservationManager`] -- Capacity admission by
//!   event-point sweep.
//! - [`dependency::DependencyGraph`] -- Validated recipe step DAG.
//! - [`orchestrator::RecipeOrchestrator`] -- Recipe-run step bookkeeping.
//! - [`registry::Registry`] -- Immutable definitions, frozen at startup.
//! - [`fixed::Fixed64`] -- Q32.32 fixed-point type for deterministic math.
//! - [`serialize`] -- Versioned snapshots via bitcode.
//! - [`replay`] -- Rebuilding an engine from its lifecycle log.

pub mod config;
pub mod definition;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod event;
pub mod fixed;
pub mod formula;
pub mod id;
pub mod inventory;
pub mod journal;
pub mod orchestrator;
pub mod registry;
pub mod replay;
pub mod reservation;
pub mod scheduler;
pub mod serialize;
pub mod sim;
pub mod store;
pub mod units;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
