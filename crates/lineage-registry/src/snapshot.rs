use std::sync::Arc;

use lineage_store::{decode_json, read_json, KvStore, Namespace, Transaction};
use lineage_types::{CheckpointRef, LineId, SnapshotId, State};
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::keys;
use crate::line::{Line, Snapshot};
use crate::registry::{load_line, put_record};

/// Append-only per-line snapshot history.
pub struct SnapshotLog<S: KvStore> {
    pub(crate) store: Arc<S>,
}

impl<S: KvStore> Clone for SnapshotLog<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KvStore> SnapshotLog<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Record `state` as the line's next snapshot and make it the line's
    /// materialized state, in one atomic batch.
    pub fn append_snapshot(
        &self,
        line_id: &LineId,
        step_kind: &str,
        state: State,
    ) -> RegistryResult<Snapshot> {
        let mut txn = Transaction::new(self.store.as_ref());
        let mut line = load_line(&mut txn, line_id)?;
        let snapshot = self.stage_append(&mut txn, &mut line, step_kind, state)?;
        txn.commit()?;
        Ok(snapshot)
    }

    /// Stage a snapshot append on an already-loaded line.
    pub fn stage_append(
        &self,
        txn: &mut Transaction<'_, S>,
        line: &mut Line,
        step_kind: &str,
        state: State,
    ) -> RegistryResult<Snapshot> {
        if line.status.is_terminal() {
            return Err(RegistryError::LineClosed {
                id: line.id,
                status: line.status,
            });
        }
        stage_snapshot(txn, line, step_kind, state)
    }

    pub fn get_snapshot(&self, line_id: &LineId, id: SnapshotId) -> RegistryResult<Snapshot> {
        self.find_snapshot(line_id, id)?
            .ok_or_else(|| snapshot_not_found(line_id, id))
    }

    pub fn find_snapshot(
        &self,
        line_id: &LineId,
        id: SnapshotId,
    ) -> RegistryResult<Option<Snapshot>> {
        Ok(read_json(
            self.store.as_ref(),
            Namespace::Snapshots,
            &keys::snapshot(line_id, id),
        )?)
    }

    /// Every snapshot of a line, oldest first.
    pub fn list_snapshots(&self, line_id: &LineId) -> RegistryResult<Vec<Snapshot>> {
        if self
            .store
            .get(Namespace::Lines, &keys::line(line_id))?
            .is_none()
        {
            return Err(RegistryError::line_not_found(line_id));
        }
        self.store
            .scan(Namespace::Snapshots, &keys::snapshots_prefix(line_id))?
            .into_iter()
            .map(|(key, bytes)| Ok(decode_json(Namespace::Snapshots, &key, &bytes)?))
            .collect()
    }

    pub fn latest_snapshot(&self, line_id: &LineId) -> RegistryResult<Option<Snapshot>> {
        let count = self
            .store
            .counter(Namespace::Counters, &keys::snapshot_counter(line_id))?;
        if count == 0 {
            return Ok(None);
        }
        self.find_snapshot(line_id, SnapshotId::new(count))
    }

    /// Resolve a checkpoint reference to a concrete snapshot id.
    pub fn resolve(&self, line_id: &LineId, checkpoint: CheckpointRef) -> RegistryResult<SnapshotId> {
        let mut txn = Transaction::new(self.store.as_ref());
        let line = load_line(&mut txn, line_id)?;
        self.resolve_in(&mut txn, &line, checkpoint)
    }

    /// Resolve a checkpoint reference inside a transaction. `Latest` becomes
    /// the line's newest snapshot as of the loaded `line`.
    pub fn resolve_in(
        &self,
        txn: &mut Transaction<'_, S>,
        line: &Line,
        checkpoint: CheckpointRef,
    ) -> RegistryResult<SnapshotId> {
        let id = match checkpoint {
            CheckpointRef::Latest => line.latest_snapshot_id().ok_or_else(|| {
                RegistryError::NotFound {
                    what: format!("latest snapshot of line {} (line has no snapshots)", line.id),
                }
            })?,
            CheckpointRef::Snapshot(id) => id,
        };
        if read_snapshot_in(txn, &line.id, id)?.is_none() {
            return Err(snapshot_not_found(&line.id, id));
        }
        debug!(line = %line.id, %checkpoint, resolved = %id, "checkpoint resolved");
        Ok(id)
    }

    /// Read a snapshot inside a transaction.
    pub fn read_in(
        &self,
        txn: &mut Transaction<'_, S>,
        line_id: &LineId,
        id: SnapshotId,
    ) -> RegistryResult<Snapshot> {
        read_snapshot_in(txn, line_id, id)?.ok_or_else(|| snapshot_not_found(line_id, id))
    }
}

pub(crate) fn read_snapshot_in<S: KvStore + ?Sized>(
    txn: &mut Transaction<'_, S>,
    line_id: &LineId,
    id: SnapshotId,
) -> RegistryResult<Option<Snapshot>> {
    Ok(txn.get_json(Namespace::Snapshots, &keys::snapshot(line_id, id))?)
}

/// Write the next snapshot of `line`, bump its counter and rewrite its
/// record with the new state.
pub(crate) fn stage_snapshot<S: KvStore + ?Sized>(
    txn: &mut Transaction<'_, S>,
    line: &mut Line,
    step_kind: &str,
    state: State,
) -> RegistryResult<Snapshot> {
    let id = SnapshotId::new(line.snapshot_count + 1);
    let key = keys::snapshot(&line.id, id);
    txn.expect_absent(Namespace::Snapshots, &key)?;

    let now = lineage_types::now();
    let snapshot = Snapshot {
        id,
        line_id: line.id,
        state: state.clone(),
        step_kind: step_kind.to_string(),
        created_at: now,
    };
    txn.put_json(Namespace::Snapshots, &key, &snapshot)?;
    txn.increment(Namespace::Counters, &keys::snapshot_counter(&line.id), 1);

    line.state = state;
    line.snapshot_count = id.seq();
    line.updated_at = now;
    put_record(txn, line)?;

    debug!(line = %line.id, snapshot = %id, step_kind, "staged snapshot");
    Ok(snapshot)
}

fn snapshot_not_found(line_id: &LineId, id: SnapshotId) -> RegistryError {
    RegistryError::NotFound {
        what: format!("snapshot {id} of line {line_id}"),
    }
}
