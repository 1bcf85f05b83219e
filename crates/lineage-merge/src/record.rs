use lineage_types::{LineId, MergeId, SnapshotId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::strategy::MergeStrategy;
use crate::three_way::Conflict;

/// Immutable audit record of one successful merge.
///
/// Written in the same atomic batch as the target's new state and the
/// source's `Merged` transition; never updated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub id: MergeId,
    pub timestamp: Timestamp,
    pub target_line_id: LineId,
    pub source_line_id: LineId,
    pub strategy: MergeStrategy,
    /// Name of the conflict resolver in effect.
    pub resolver: String,
    /// The common ancestor used by a three-way merge.
    pub base_snapshot_id: Option<SnapshotId>,
    pub conflicts: Vec<Conflict>,
    /// The target snapshot holding the merged state.
    pub resulting_snapshot_id: SnapshotId,
}

/// What a merge call returns to its caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    pub merge_id: MergeId,
    pub conflicts: Vec<Conflict>,
    pub resulting_snapshot_id: SnapshotId,
}

impl From<&MergeRecord> for MergeResult {
    fn from(record: &MergeRecord) -> Self {
        Self {
            success: true,
            merge_id: record.id,
            conflicts: record.conflicts.clone(),
            resulting_snapshot_id: record.resulting_snapshot_id,
        }
    }
}
