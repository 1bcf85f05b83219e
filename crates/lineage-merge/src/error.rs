use lineage_types::FieldKey;

/// Failure reported by a [`crate::ConflictResolver`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("resolver declined: {0}")]
    Declined(String),

    #[error("resolver is not deterministic")]
    NonDeterministic,
}

/// Errors produced while computing a merge.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("conflict resolution failed on {field} with resolver '{resolver}': {source}")]
    ConflictResolution {
        field: FieldKey,
        resolver: String,
        #[source]
        source: ResolveError,
    },

    #[error("unknown merge strategy '{0}' (expected overwrite or three_way)")]
    UnknownStrategy(String),
}
