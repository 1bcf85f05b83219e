//! Store key layout.
//!
//! Snapshot keys embed the zero-padded sequence number so a prefix scan
//! returns a line's snapshots in ascending order.

use lineage_types::{LineId, SnapshotId};

pub fn line(id: &LineId) -> String {
    id.to_string()
}

pub fn child(parent: &LineId, child: &LineId) -> String {
    format!("{parent}/{child}")
}

pub fn children_prefix(parent: &LineId) -> String {
    format!("{parent}/")
}

pub fn snapshot(line: &LineId, id: SnapshotId) -> String {
    format!("{line}/{}", id.to_key())
}

pub fn snapshots_prefix(line: &LineId) -> String {
    format!("{line}/")
}

pub fn snapshot_counter(line: &LineId) -> String {
    format!("line/{line}/snapshots")
}

pub fn branch_counter(line: &LineId) -> String {
    format!("line/{line}/branches")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_keys_sort_numerically() {
        let id = LineId::new();
        let k9 = snapshot(&id, SnapshotId::new(9));
        let k10 = snapshot(&id, SnapshotId::new(10));
        assert!(k9 < k10);
        assert!(k9.starts_with(&snapshots_prefix(&id)));
    }

    #[test]
    fn counter_keys_are_distinct() {
        let id = LineId::new();
        assert_ne!(snapshot_counter(&id), branch_counter(&id));
    }
}
