use crate::namespace::Namespace;

/// Errors from key/value store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A batch guard did not match the stored value; nothing was written.
    #[error("write conflict on {ns}/{key}")]
    Conflict { ns: Namespace, key: String },

    /// A counter key holds something other than an 8-byte counter.
    #[error("invalid counter value at {ns}/{key}")]
    InvalidCounter { ns: Namespace, key: String },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk log has an invalid frame and tail truncation is disabled.
    #[error("corrupt log at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// A fault injected by a test harness.
    #[error("injected failure: {0}")]
    Injected(String),

    /// A lock guarding the backend was poisoned by a panicking writer.
    #[error("store lock poisoned: {0}")]
    Poisoned(String),
}

impl StoreError {
    /// Returns `true` for optimistic-concurrency conflicts, which are safe to
    /// retry after re-reading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
