use std::fmt;

use lineage_store::StoreError;
use lineage_types::LineId;
use serde::{Deserialize, Serialize};

/// Which ceiling a rejected step ran into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    /// The whole-line ceiling.
    Line,
    /// The step kind's own ceiling.
    StepKind,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line => f.write_str("line"),
            Self::StepKind => f.write_str("step kind"),
        }
    }
}

/// Errors produced by the iteration guard.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("iteration limit exceeded on line {line}: {scope} ceiling of {limit} reached for step '{step_kind}'")]
    IterationLimitExceeded {
        line: LineId,
        step_kind: String,
        limit: u64,
        scope: LimitScope,
    },

    #[error("invalid guard configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for guard operations.
pub type GuardResult<T> = Result<T, GuardError>;
