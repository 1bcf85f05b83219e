use thiserror::Error;

/// Errors produced by type parsing and validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid line id: {0}")]
    InvalidLineId(String),

    #[error("invalid merge id: {0}")]
    InvalidMergeId(String),

    #[error("invalid checkpoint reference: {0}")]
    InvalidCheckpoint(String),

    #[error("invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    #[error("unknown line status: {0}")]
    UnknownStatus(String),

    #[error("invalid field key: {0}")]
    InvalidFieldKey(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}
