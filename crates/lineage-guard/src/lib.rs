//! Iteration guard for the lineage engine.
//!
//! Before each step the caller asks the guard whether another step of a
//! given kind may run on a line. Two ceilings apply: a whole-line ceiling
//! ([`GuardConfig::max_steps_per_line`]) and optional per-step-kind ceilings
//! ([`GuardConfig::step_limits`]). Exceeding either is a hard stop; the
//! caller decides what happens to the line.
//!
//! ```rust
//! use std::sync::Arc;
//! use lineage_guard::{GuardConfig, IterationGuard};
//! use lineage_store::InMemoryKvStore;
//! use lineage_types::LineId;
//!
//! let guard = IterationGuard::new(
//!     Arc::new(InMemoryKvStore::new()),
//!     GuardConfig::default().with_max_steps(1),
//! );
//! let line = LineId::new();
//! assert!(guard.check(&line, "step").unwrap());
//! guard.record(&line, "step").unwrap();
//! assert!(!guard.check(&line, "step").unwrap());
//! ```

pub mod config;
pub mod error;
pub mod guard;

pub use config::GuardConfig;
pub use error::{GuardError, GuardResult, LimitScope};
pub use guard::{GuardDecision, IterationCounts, IterationGuard, MERGE_STEP};
