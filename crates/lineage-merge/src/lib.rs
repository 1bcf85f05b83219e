//! Merge algorithms for the lineage engine.
//!
//! Two strategies fold a source line's state into a target line:
//!
//! - [`MergeStrategy::Overwrite`]: the source state wins wholesale
//! - [`MergeStrategy::ThreeWay`]: field-level merge against the common
//!   ancestor, with a [`ConflictResolver`] deciding fields that changed on
//!   both sides
//!
//! Everything here is pure computation; persisting the outcome is the
//! engine's job.

pub mod diff;
pub mod error;
pub mod record;
pub mod resolver;
pub mod strategy;
pub mod three_way;

pub use diff::{diff_states, FieldChange, StateDiff};
pub use error::{MergeError, ResolveError};
pub use record::{MergeRecord, MergeResult};
pub use resolver::{
    builtin, resolve_checked, ConflictInput, ConflictResolver, FnResolver, SourceWins, TargetWins,
};
pub use strategy::MergeStrategy;
pub use three_way::{overwrite, three_way, Conflict, MergeOutcome};
