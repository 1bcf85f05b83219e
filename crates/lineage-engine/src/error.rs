use lineage_guard::{GuardError, LimitScope};
use lineage_merge::{MergeError, ResolveError};
use lineage_registry::RegistryError;
use lineage_store::StoreError;
use lineage_types::{FieldKey, LineId, LineStatus};

use crate::config::ConfigError;

/// Errors returned by engine operations.
///
/// Every variant maps to a stable [`kind`](EngineError::kind) tag that callers
/// can match on without parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid ancestry: {0}")]
    InvalidAncestry(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: LineStatus, to: LineStatus },

    #[error("line {line} is {status} and accepts no new snapshots")]
    LineClosed { line: LineId, status: LineStatus },

    #[error("line {line} is {status} and cannot be forked")]
    NotForkable { line: LineId, status: LineStatus },

    #[error("iteration limit exceeded on line {line}: {scope} ceiling of {limit} reached for step '{step_kind}'")]
    IterationLimitExceeded {
        line: LineId,
        step_kind: String,
        limit: u64,
        scope: LimitScope,
    },

    #[error("validation failed: {}", .violations.join("; "))]
    Validation { violations: Vec<String> },

    #[error("storage failure during {step}: {source}")]
    Storage {
        step: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("conflict resolution failed on {field} with resolver '{resolver}': {source}")]
    ConflictResolution {
        field: FieldKey,
        resolver: String,
        #[source]
        source: ResolveError,
    },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Stable, machine-readable error tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidAncestry(_) => "invalid_ancestry",
            Self::InvalidTransition { .. } | Self::LineClosed { .. } => "invalid_transition",
            Self::NotForkable { .. } => "not_forkable",
            Self::IterationLimitExceeded { .. } => "iteration_limit_exceeded",
            Self::Validation { .. } => "validation",
            Self::Storage { .. } => "storage",
            Self::ConflictResolution { .. } => "conflict_resolution",
            Self::Timeout { .. } => "timeout",
            Self::Config(_) => "config",
        }
    }

    pub(crate) fn validation(violation: impl Into<String>) -> Self {
        Self::Validation {
            violations: vec![violation.into()],
        }
    }

    fn from_registry(err: RegistryError, step: &'static str) -> Self {
        match err {
            RegistryError::NotFound { what } => Self::NotFound(what),
            RegistryError::InvalidAncestry(reason) => Self::InvalidAncestry(reason),
            RegistryError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            RegistryError::NotForkable { id, status } => Self::NotForkable { line: id, status },
            RegistryError::LineClosed { id, status } => Self::LineClosed { line: id, status },
            RegistryError::Store(source) => Self::Storage { step, source },
            RegistryError::Serialization(reason) => Self::Storage {
                step,
                source: StoreError::Serialization(reason),
            },
        }
    }

    fn from_guard(err: GuardError, step: &'static str) -> Self {
        match err {
            GuardError::IterationLimitExceeded {
                line,
                step_kind,
                limit,
                scope,
            } => Self::IterationLimitExceeded {
                line,
                step_kind,
                limit,
                scope,
            },
            GuardError::InvalidConfig(reason) => Self::Config(ConfigError::Invalid(reason)),
            GuardError::Store(source) => Self::Storage { step, source },
        }
    }
}

impl From<MergeError> for EngineError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::ConflictResolution {
                field,
                resolver,
                source,
            } => Self::ConflictResolution {
                field,
                resolver,
                source,
            },
            MergeError::UnknownStrategy(name) => {
                Self::validation(format!("unknown merge strategy '{name}'"))
            }
        }
    }
}

/// Attach the failing step to lower-layer errors.
pub(crate) trait AtStep<T> {
    fn at_step(self, step: &'static str) -> EngineResult<T>;
}

impl<T> AtStep<T> for Result<T, RegistryError> {
    fn at_step(self, step: &'static str) -> EngineResult<T> {
        self.map_err(|e| EngineError::from_registry(e, step))
    }
}

impl<T> AtStep<T> for Result<T, StoreError> {
    fn at_step(self, step: &'static str) -> EngineResult<T> {
        self.map_err(|source| EngineError::Storage { step, source })
    }
}

impl<T> AtStep<T> for Result<T, GuardError> {
    fn at_step(self, step: &'static str) -> EngineResult<T> {
        self.map_err(|e| EngineError::from_guard(e, step))
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let line = LineId::new();
        assert_eq!(EngineError::NotFound("line x".into()).kind(), "not_found");
        assert_eq!(
            EngineError::NotForkable {
                line,
                status: LineStatus::Completed
            }
            .kind(),
            "not_forkable"
        );
        assert_eq!(
            EngineError::Timeout { operation: "merge" }.kind(),
            "timeout"
        );
        assert_eq!(EngineError::validation("x").kind(), "validation");
    }

    #[test]
    fn registry_errors_keep_their_kind() {
        let err: EngineResult<()> = Err(RegistryError::InvalidTransition {
            from: LineStatus::Completed,
            to: LineStatus::Active,
        })
        .at_step("transition");
        assert_eq!(err.unwrap_err().kind(), "invalid_transition");

        let err: EngineResult<()> = Err(RegistryError::Store(StoreError::Injected("x".into())))
            .at_step("commit merge");
        let err = err.unwrap_err();
        assert_eq!(err.kind(), "storage");
        assert!(err.to_string().contains("commit merge"));
    }

    #[test]
    fn validation_lists_every_violation() {
        let err = EngineError::Validation {
            violations: vec!["first".into(), "second".into()],
        };
        assert_eq!(err.to_string(), "validation failed: first; second");
    }
}
