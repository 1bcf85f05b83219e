//! Checkpointed execution lineage engine.
//!
//! An execution *line* is a sequence of state snapshots. Lines can be forked
//! at any snapshot into independent branches and merged back, with every
//! multi-record change committed atomically over a [`KvStore`](lineage_store::KvStore).
//!
//! ```no_run
//! use std::sync::Arc;
//! use lineage_engine::{Engine, ForkRequest, MergeRequest, OpContext};
//! use lineage_registry::NewLine;
//! use lineage_store::InMemoryKvStore;
//! use lineage_types::{CheckpointRef, State};
//!
//! # async fn demo() -> Result<(), lineage_engine::EngineError> {
//! let engine = Engine::builder(Arc::new(InMemoryKvStore::new())).build()?;
//! let main = engine
//!     .create_line(NewLine::root().with_state(State::new().with("x", 1)), OpContext::default())
//!     .await?;
//! let branch = engine
//!     .fork(ForkRequest::new(main, CheckpointRef::Latest, "try"), OpContext::default())
//!     .await?;
//! engine
//!     .append_snapshot(&branch, "step", State::new().with("x", 2), OpContext::default())
//!     .await?;
//! let result = engine.merge(MergeRequest::new(main, branch), OpContext::default()).await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod branch;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod history;
pub mod idempotency;
pub mod locks;
pub mod merge;

pub use branch::ForkRequest;
pub use config::{ConfigError, EngineConfig, MergeConfig};
pub use context::OpContext;
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use history::{
    EntityType, HistoryAction, HistoryEntry, HistoryError, HistoryRecorder, MemoryHistory,
    NoopHistory, TracingHistory,
};
pub use idempotency::{fingerprint, IdempotencyRecord, IdempotentOutcome};
pub use locks::{LineGuard, LineLocks};
pub use merge::MergeRequest;
