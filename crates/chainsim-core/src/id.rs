use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a string-keyed definition identifier. Definition ids come from
/// data files, so they stay human-readable all the way through the kernel.
macro_rules! name_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

name_id! {
    /// Identifies an item (raw material, intermediate, product, or machine).
    ItemId
}

name_id! {
    /// Identifies a process definition.
    ProcessId
}

name_id! {
    /// Identifies a recipe definition.
    RecipeId
}

name_id! {
    /// Identifies a machine type. Machines are items that can be built and
    /// reserved; the id is shared with the machine's item definition.
    MachineId
}

impl From<&MachineId> for ItemId {
    fn from(m: &MachineId) -> Self {
        ItemId(m.0.clone())
    }
}

/// Identifies one scheduled execution of a process. Allocated by the engine
/// from a monotonic counter so that replays assign the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessRunId(pub u64);

impl fmt::Display for ProcessRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Identifies one execution of a recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecipeRunId(pub u64);

impl fmt::Display for RecipeRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recipe-run-{}", self.0)
    }
}

/// Unique key of a queued scheduler event, used for cancellation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn start(run: ProcessRunId) -> Self {
        Self(format!("start_{run}"))
    }

    pub fn complete(run: ProcessRunId) -> Self {
        Self(format!("complete_{run}"))
    }

    pub fn release(run: ProcessRunId, machine: &MachineId) -> Self {
        Self(format!("release_{run}_{machine}"))
    }

    pub fn step_ready(recipe_run: RecipeRunId, attempt: u64) -> Self {
        Self(format!("step_ready_{recipe_run}_{attempt}"))
    }

    /// Whether this event belongs to the given process run.
    pub fn belongs_to(&self, run: ProcessRunId) -> bool {
        let suffix = run.to_string();
        self.0 == format!("start_{suffix}")
            || self.0 == format!("complete_{suffix}")
            || self.0.starts_with(&format!("release_{suffix}_"))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
