//! Foundation types for the checkpointed execution lineage engine.
//!
//! Every other lineage crate depends on `lineage-types`.
//!
//! # Key Types
//!
//! - [`LineId`]: UUID v7 identity of an execution line
//! - [`SnapshotId`]: per-line snapshot sequence number
//! - [`CheckpointRef`]: symbolic (`latest`) or concrete snapshot reference
//! - [`MergeId`]: UUID v7 identity of a merge record
//! - [`IdempotencyKey`]: retry token for fork and merge requests
//! - [`LineStatus`]: the line lifecycle state machine
//! - [`State`] / [`StateValue`] / [`FieldKey`]: versioned, typed state records

pub mod error;
pub mod ids;
pub mod state;
pub mod status;

pub use error::TypeError;
pub use ids::{CheckpointRef, IdempotencyKey, LineId, MergeId, SnapshotId};
pub use state::{FieldKey, FieldScope, State, StateSchema, StateValue};
pub use status::LineStatus;

/// Wall-clock timestamp used for `created_at` / `updated_at` fields.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// The current wall-clock time.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}
