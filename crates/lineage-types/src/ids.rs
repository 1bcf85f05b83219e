use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Unique identifier for an execution line (UUID v7 for time-ordering).
///
/// Line ids are immutable once created. Their string form is the hyphenated
/// UUID; `Ord` agrees with the string order, and lock acquisition across
/// lines relies on this total order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineId(uuid::Uuid);

impl LineId {
    /// Generate a new time-ordered line ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Short representation (first 8 characters of UUID).
    pub fn short_id(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for LineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LineId({})", self.short_id())
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LineId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| TypeError::InvalidLineId(format!("{s}: {e}")))
    }
}

/// Unique identifier for a merge record (UUID v7, so history sorts by time).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergeId(uuid::Uuid);

impl MergeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn short_id(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for MergeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MergeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MergeId({})", self.short_id())
    }
}

impl fmt::Display for MergeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MergeId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| TypeError::InvalidMergeId(format!("{s}: {e}")))
    }
}

/// Sequence number of a snapshot within its line.
///
/// The first snapshot of a line is `1`; ids increase by one with every
/// accepted step, so a line's snapshot sequence never has gaps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(u64);

impl SnapshotId {
    /// The first snapshot id of every line.
    pub const FIRST: Self = Self(1);

    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub const fn seq(&self) -> u64 {
        self.0
    }

    /// The id following this one.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Zero-padded form used in storage keys so that lexicographic order
    /// matches numeric order.
    pub fn to_key(&self) -> String {
        format!("{:020}", self.0)
    }
}

impl fmt::Debug for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotId(#{})", self.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches('#');
        match digits.parse::<u64>() {
            Ok(0) | Err(_) => Err(TypeError::InvalidCheckpoint(s.to_string())),
            Ok(seq) => Ok(Self(seq)),
        }
    }
}

/// A reference to a checkpoint of a line, possibly symbolic.
///
/// `Latest` must be resolved to a concrete [`SnapshotId`] once, at the start
/// of an operation; only the resolved id is used afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointRef {
    /// The most recent snapshot at resolution time.
    Latest,
    /// A specific snapshot.
    Snapshot(SnapshotId),
}

impl From<SnapshotId> for CheckpointRef {
    fn from(id: SnapshotId) -> Self {
        Self::Snapshot(id)
    }
}

impl fmt::Display for CheckpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Snapshot(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for CheckpointRef {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("latest") {
            Ok(Self::Latest)
        } else {
            s.parse::<SnapshotId>().map(Self::Snapshot)
        }
    }
}

/// Token that makes retried fork/merge requests idempotent.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Maximum accepted length in bytes.
    pub const MAX_LEN: usize = 128;

    /// Wrap a caller-supplied token.
    pub fn new(token: impl Into<String>) -> Result<Self, TypeError> {
        let token = token.into();
        if token.is_empty() {
            return Err(TypeError::InvalidIdempotencyKey("empty".into()));
        }
        if token.len() > Self::MAX_LEN {
            return Err(TypeError::InvalidIdempotencyKey(format!(
                "{} bytes exceeds {}",
                token.len(),
                Self::MAX_LEN
            )));
        }
        if token.chars().any(char::is_control) {
            return Err(TypeError::InvalidIdempotencyKey(
                "contains control characters".into(),
            ));
        }
        Ok(Self(token))
    }

    /// Generate a fresh random-looking token (UUID v7).
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdempotencyKey({})", self.0)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
