use lineage_store::StoreError;
use lineage_types::{LineId, LineStatus};

/// Errors produced by the lineage registry and snapshot log.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("invalid ancestry: {0}")]
    InvalidAncestry(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: LineStatus, to: LineStatus },

    #[error("line {id} is {status} and cannot be forked")]
    NotForkable { id: LineId, status: LineStatus },

    #[error("line {id} is {status} and accepts no new snapshots")]
    LineClosed { id: LineId, status: LineStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RegistryError {
    pub(crate) fn line_not_found(id: &LineId) -> Self {
        Self::NotFound {
            what: format!("line {id}"),
        }
    }
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
