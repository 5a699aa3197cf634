//! Engine-level error taxonomy.
//!
//! Every public engine operation returns `Result<_, SimError>`. Module
//! errors are folded into these kinds at the engine boundary. A failed call
//! leaves engine state as it was before the call.

use crate::definition::RuleViolation;
use crate::dependency::GraphError;
use crate::fixed::Quantity;
use crate::formula::FormulaError;
use crate::id::{ItemId, MachineId};
use crate::reservation::ReservationError;
use crate::scheduler::SchedulerError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A missing input, in the unit the process asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub item: ItemId,
    pub needed: Quantity,
    pub available: Quantity,
    pub unit: String,
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: need {} {}, have {}",
            self.item, self.needed, self.unit, self.available
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimError {
    #[error("no definition for {0}")]
    KbGap(String),

    #[error("validation failed: {}", join(.violations))]
    Validation { violations: Vec<RuleViolation> },

    #[error("insufficient inputs: {}", join(.shortfalls))]
    InsufficientInputs { shortfalls: Vec<Shortfall> },

    #[error("machine conflict on {machine}: {source}")]
    MachineConflict {
        machine: MachineId,
        #[source]
        source: ReservationError,
    },

    #[error("duration calculation failed: {0}")]
    DurationCalculationFailed(#[from] FormulaError),

    #[error("step {step} could not be scheduled: {cause}")]
    StepSchedulingFailed { step: usize, cause: Box<SimError> },

    #[error("advance failed: {0}")]
    AdvanceFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(T::to_string).collect::<Vec<_>>().join("; ")
}

/// Stable snake_case name of each failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    KbGap,
    ValidationError,
    InsufficientInputs,
    MachineConflict,
    DurationCalculationFailed,
    StepSchedulingFailed,
    AdvanceFailed,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::KbGap => "kb_gap",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::InsufficientInputs => "insufficient_inputs",
            ErrorKind::MachineConflict => "machine_conflict",
            ErrorKind::DurationCalculationFailed => "duration_calculation_failed",
            ErrorKind::StepSchedulingFailed => "step_scheduling_failed",
            ErrorKind::AdvanceFailed => "advance_failed",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SimError::KbGap(_) => ErrorKind::KbGap,
            SimError::Validation { .. } => ErrorKind::ValidationError,
            SimError::InsufficientInputs { .. } => ErrorKind::InsufficientInputs,
            SimError::MachineConflict { .. } => ErrorKind::MachineConflict,
            SimError::DurationCalculationFailed(_) => ErrorKind::DurationCalculationFailed,
            SimError::StepSchedulingFailed { .. } => ErrorKind::StepSchedulingFailed,
            SimError::AdvanceFailed(_) => ErrorKind::AdvanceFailed,
            SimError::Internal(_) => ErrorKind::InternalError,
        }
    }

    pub fn validation(violations: Vec<RuleViolation>) -> Self {
        SimError::Validation { violations }
    }

    pub fn is_machine_conflict(&self) -> bool {
        self.kind() == ErrorKind::MachineConflict
    }
}

impl From<GraphError> for SimError {
    fn from(e: GraphError) -> Self {
        SimError::Validation {
            violations: vec![RuleViolation::new("recipe_dependencies", e.to_string())],
        }
    }
}

impl From<SchedulerError> for SimError {
    fn from(e: SchedulerError) -> Self {
        SimError::Internal(e.to_string())
    }
}

/// `{success, error, message}` record for automation callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub error: Option<ErrorKind>,
    pub message: Option<String>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self { success: true, error: None, message: None }
    }

    pub fn from_result<T>(result: &Result<T, SimError>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self {
                success: false,
                error: Some(e.kind()),
                message: Some(e.to_string()),
            },
        }
    }
}
