//! Snapshot store contract for the lineage engine.
//!
//! The store is a namespaced key/value map of opaque byte values. It never
//! interprets what it holds: line records, snapshots, counters, merge records
//! and idempotency records are all encoded by the crates above it.
//!
//! # Contract
//!
//! All backends implement [`KvStore`]:
//!
//! - `get` / `put` / `delete` / `scan`: the minimal KV surface
//! - `apply`: an atomic [`WriteBatch`]. Guards are checked first, then every
//!   op is applied, or nothing is
//! - `increment`: atomic counter increment (never read-modify-write in
//!   caller code)
//!
//! [`Transaction`] layers optimistic concurrency on top: every read records
//! a guard on the observed bytes, writes are buffered, and `commit` submits a
//! single batch. Dropping a transaction without committing writes nothing.
//!
//! # Backends
//!
//! - [`InMemoryKvStore`]: `BTreeMap` behind a `RwLock`, for tests and embedding
//! - [`FileKvStore`]: append-only write-ahead log replayed on open

pub mod batch;
pub mod error;
pub mod file;
pub mod memory;
pub mod namespace;
pub mod traits;
pub mod txn;

pub use batch::{decode_counter, encode_counter, Guard, WriteBatch, WriteOp};
pub use error::{StoreError, StoreResult};
pub use file::{FileKvStore, FileStoreConfig, SyncMode};
pub use memory::InMemoryKvStore;
pub use namespace::Namespace;
pub use traits::KvStore;
pub use txn::{decode_json, encode_json, read_json, Transaction};
