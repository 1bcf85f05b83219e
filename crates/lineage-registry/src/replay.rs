use std::collections::HashSet;

use lineage_store::KvStore;
use lineage_types::{LineId, State};
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::line::Line;
use crate::registry::LineageRegistry;
use crate::snapshot::SnapshotLog;

/// Result of replaying a line's ancestry into its state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayResult {
    pub line: LineId,
    /// Lines walked, root first, ending with `line`.
    pub chain: Vec<LineId>,
    pub snapshots_applied: u64,
    pub state: State,
}

/// Result of checking one line's stored history against its record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineReport {
    pub line: LineId,
    pub snapshot_count: u64,
    pub violations: Vec<Violation>,
}

impl LineReport {
    /// Returns `true` if all checks passed.
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    SequenceGap,
    CountMismatch,
    ForeignSnapshot,
    MissingOrigin,
    StateDivergence,
}

impl<S: KvStore> SnapshotLog<S> {
    /// Rebuild a line's state from the root of its ancestry.
    ///
    /// Each ancestor contributes its snapshots up to the origin snapshot of
    /// the next line in the chain; the line itself contributes all of its
    /// own. Snapshots record full states, so folding them in order yields the
    /// last one applied.
    pub fn replay(&self, line_id: &LineId) -> RegistryResult<ReplayResult> {
        let chain = self.ancestry(line_id)?;
        let mut state = State::new();
        let mut applied = 0u64;

        for (i, line) in chain.iter().enumerate() {
            let upto = chain.get(i + 1).and_then(|child| child.origin_snapshot_id);
            for snapshot in self.list_snapshots(&line.id)? {
                if upto.is_some_and(|limit| snapshot.id > limit) {
                    break;
                }
                state = snapshot.state;
                applied += 1;
            }
        }

        debug!(line = %line_id, depth = chain.len(), applied, "replayed line");
        Ok(ReplayResult {
            line: *line_id,
            chain: chain.iter().map(|l| l.id).collect(),
            snapshots_applied: applied,
            state,
        })
    }

    /// Returns `true` if replaying the line reproduces its materialized state.
    pub fn verify_line(&self, line_id: &LineId) -> RegistryResult<bool> {
        Ok(self.validate_line(line_id)?.is_consistent())
    }

    /// Check sequence contiguity, counter agreement, origin links and replay
    /// convergence for one line.
    pub fn validate_line(&self, line_id: &LineId) -> RegistryResult<LineReport> {
        let registry = LineageRegistry::new(self.store.clone());
        let line = registry.get_line(line_id)?;
        let snapshots = self.list_snapshots(line_id)?;
        let mut violations = Vec::new();

        for (index, snapshot) in snapshots.iter().enumerate() {
            let expected = index as u64 + 1;
            if snapshot.id.seq() != expected {
                violations.push(Violation {
                    kind: ViolationKind::SequenceGap,
                    description: format!("expected snapshot #{expected}, found {}", snapshot.id),
                });
            }
            if snapshot.line_id != line.id {
                violations.push(Violation {
                    kind: ViolationKind::ForeignSnapshot,
                    description: format!(
                        "snapshot {} is owned by line {}",
                        snapshot.id, snapshot.line_id
                    ),
                });
            }
        }

        if snapshots.len() as u64 != line.snapshot_count {
            violations.push(Violation {
                kind: ViolationKind::CountMismatch,
                description: format!(
                    "snapshot_count is {} but {} snapshots are stored",
                    line.snapshot_count,
                    snapshots.len()
                ),
            });
        }

        if let (Some(parent), Some(origin)) = (line.parent_line_id, line.origin_snapshot_id) {
            if self.find_snapshot(&parent, origin)?.is_none() {
                violations.push(Violation {
                    kind: ViolationKind::MissingOrigin,
                    description: format!("origin snapshot {origin} of parent {parent} is missing"),
                });
            }
        }

        let replayed = self.replay(line_id)?;
        if replayed.state != line.state {
            violations.push(Violation {
                kind: ViolationKind::StateDivergence,
                description: "replayed state differs from the materialized state".into(),
            });
        }

        Ok(LineReport {
            line: line.id,
            snapshot_count: line.snapshot_count,
            violations,
        })
    }

    /// The line and its ancestors, root first.
    fn ancestry(&self, line_id: &LineId) -> RegistryResult<Vec<Line>> {
        let registry = LineageRegistry::new(self.store.clone());
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(*line_id);

        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(RegistryError::InvalidAncestry(format!(
                    "ancestry of {line_id} loops through {id}"
                )));
            }
            let line = registry.get_line(&id)?;
            next = line.parent_line_id;
            chain.push(line);
        }

        chain.reverse();
        Ok(chain)
    }
}
