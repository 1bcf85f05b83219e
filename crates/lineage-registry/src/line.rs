use std::collections::BTreeMap;

use lineage_types::{LineId, LineStatus, SnapshotId, State, Timestamp};
use serde::{Deserialize, Serialize};

/// An execution line as seen by callers: the stored record joined with its
/// counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub id: LineId,
    pub name: Option<String>,
    pub status: LineStatus,
    pub status_reason: Option<String>,
    pub parent_line_id: Option<LineId>,
    pub origin_snapshot_id: Option<SnapshotId>,
    pub state: State,
    pub snapshot_count: u64,
    pub branch_count: u64,
    pub metadata: BTreeMap<String, String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Line {
    /// A line is a branch if it was forked from another line.
    pub fn is_branch(&self) -> bool {
        self.parent_line_id.is_some()
    }

    /// The most recent snapshot id, if the line has any snapshots.
    pub fn latest_snapshot_id(&self) -> Option<SnapshotId> {
        (self.snapshot_count > 0).then(|| SnapshotId::new(self.snapshot_count))
    }

    pub(crate) fn from_record(record: LineRecord, snapshot_count: u64, branch_count: u64) -> Self {
        Self {
            id: record.id,
            name: record.name,
            status: record.status,
            status_reason: record.status_reason,
            parent_line_id: record.parent_line_id,
            origin_snapshot_id: record.origin_snapshot_id,
            state: record.state,
            snapshot_count,
            branch_count,
            metadata: record.metadata,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    pub(crate) fn to_record(&self) -> LineRecord {
        LineRecord {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            status_reason: self.status_reason.clone(),
            parent_line_id: self.parent_line_id,
            origin_snapshot_id: self.origin_snapshot_id,
            state: self.state.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Stored form of a line. Counters live in their own keys so they can be
/// incremented atomically without rewriting the record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct LineRecord {
    pub id: LineId,
    #[serde(default)]
    pub name: Option<String>,
    pub status: LineStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub parent_line_id: Option<LineId>,
    #[serde(default)]
    pub origin_snapshot_id: Option<SnapshotId>,
    pub state: State,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Parameters for creating a line.
///
/// A root line may carry an initial `state`, recorded as its first snapshot
/// (step kind [`INIT_STEP`]). A branch takes its state from
/// `origin_snapshot_id` of `parent_line_id` and must not set `state`.
#[derive(Clone, Debug, Default)]
pub struct NewLine {
    pub name: Option<String>,
    pub parent_line_id: Option<LineId>,
    pub origin_snapshot_id: Option<SnapshotId>,
    pub state: Option<State>,
    pub metadata: BTreeMap<String, String>,
}

impl NewLine {
    /// A root line with an empty state.
    pub fn root() -> Self {
        Self::default()
    }

    /// A branch of `parent` starting at `origin`.
    pub fn branch(parent: LineId, origin: SnapshotId) -> Self {
        Self {
            parent_line_id: Some(parent),
            origin_snapshot_id: Some(origin),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Step kind of the snapshot recording a root line's initial state.
pub const INIT_STEP: &str = "init";

/// The per-line counters kept by the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    Snapshots,
    Branches,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshots => "snapshots",
            Self::Branches => "branches",
        }
    }
}

/// An immutable recording of a line's full state after one step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub line_id: LineId,
    pub state: State,
    pub step_kind: String,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Line {
        let now = lineage_types::now();
        Line {
            id: LineId::new(),
            name: Some("main".into()),
            status: LineStatus::Active,
            status_reason: None,
            parent_line_id: None,
            origin_snapshot_id: None,
            state: State::new().with("x", 1),
            snapshot_count: 3,
            branch_count: 1,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn record_round_trip_keeps_counters_outside() {
        let line = sample();
        let record = line.to_record();
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("snapshot_count"));
        let back: LineRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(Line::from_record(back, 3, 1), line);
    }

    #[test]
    fn latest_snapshot_follows_count() {
        let mut line = sample();
        assert_eq!(line.latest_snapshot_id(), Some(SnapshotId::new(3)));
        line.snapshot_count = 0;
        assert_eq!(line.latest_snapshot_id(), None);
        assert!(!line.is_branch());
    }
}
