use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::GuardError;

/// Step ceilings enforced by the iteration guard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Maximum number of accepted steps per line, across all step kinds.
    pub max_steps_per_line: u64,
    /// Optional per-step-kind ceilings, checked in addition to the line
    /// ceiling.
    pub step_limits: BTreeMap<String, u64>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_steps_per_line: 100,
            step_limits: BTreeMap::new(),
        }
    }
}

impl GuardConfig {
    pub fn with_max_steps(mut self, max: u64) -> Self {
        self.max_steps_per_line = max;
        self
    }

    /// Cap one step kind independently of the line ceiling.
    pub fn with_step_limit(mut self, step_kind: impl Into<String>, limit: u64) -> Self {
        self.step_limits.insert(step_kind.into(), limit);
        self
    }

    /// The ceiling for `step_kind`, if one is configured.
    pub fn limit_for(&self, step_kind: &str) -> Option<u64> {
        self.step_limits.get(step_kind).copied()
    }

    /// Reject configurations no step could ever pass.
    pub fn validate(&self) -> Result<(), GuardError> {
        if self.max_steps_per_line == 0 {
            return Err(GuardError::InvalidConfig(
                "max_steps_per_line must be at least 1".into(),
            ));
        }
        if let Some(kind) = self.step_limits.keys().find(|k| k.is_empty()) {
            return Err(GuardError::InvalidConfig(format!(
                "step limit with empty step kind {kind:?}"
            )));
        }
        Ok(())
    }
}
