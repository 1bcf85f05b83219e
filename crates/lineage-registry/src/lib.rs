//! Lineage registry: the owner of execution line records and their
//! per-line snapshot history.
//!
//! # Storage layout
//!
//! | Namespace   | Key                        | Value                      |
//! |-------------|----------------------------|----------------------------|
//! | `lines`     | `{line}`                   | line record (JSON)         |
//! | `children`  | `{parent}/{child}`         | empty                      |
//! | `snapshots` | `{line}/{seq:020}`         | [`Snapshot`] (JSON)        |
//! | `counters`  | `line/{line}/snapshots`    | `u64` snapshot count       |
//! | `counters`  | `line/{line}/branches`     | `u64` branch count         |
//!
//! Counters are kept outside the line record so they only ever change
//! through atomic increments.

pub mod error;
pub mod keys;
pub mod line;
pub mod registry;
pub mod replay;
pub mod snapshot;

pub use error::{RegistryError, RegistryResult};
pub use line::{Counter, Line, NewLine, Snapshot, INIT_STEP};
pub use registry::{ensure_forkable, LineageRegistry};
pub use replay::{LineReport, ReplayResult, Violation, ViolationKind};
pub use snapshot::SnapshotLog;
