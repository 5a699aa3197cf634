use crate::fixed::{f64_to_fixed64, Hours};
use crate::scheduler::Priorities;
use serde::{Deserialize, Serialize};

/// Engine settings. Every field has a default so partial config files load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Key under which the engine persists its log and snapshots.
    pub sim_id: String,
    /// Simulated start time. Plain hours; converted once on engine creation.
    pub start_time_hours: f64,
    /// Allow an input to be covered by another item of the same material class.
    pub allow_material_substitution: bool,
    pub priorities: Priorities,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sim_id: "default".to_string(),
            start_time_hours: 0.0,
            allow_material_substitution: true,
            priorities: Priorities::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_sim_id(sim_id: impl Into<String>) -> Self {
        Self { sim_id: sim_id.into(), ..Self::default() }
    }

    pub fn start_time(&self) -> Hours {
        f64_to_fixed64(self.start_time_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"sim_id": "moon-base"}"#).unwrap();
        assert_eq!(cfg.sim_id, "moon-base");
        assert!(cfg.allow_material_substitution);
        assert_eq!(cfg.priorities, Priorities::default());
    }
}
