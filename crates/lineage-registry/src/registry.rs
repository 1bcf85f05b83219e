use std::str::FromStr;
use std::sync::Arc;

use lineage_store::{read_json, KvStore, Namespace, Transaction};
use lineage_types::{LineId, LineStatus, State};
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::keys;
use crate::line::{Counter, Line, LineRecord, NewLine, INIT_STEP};
use crate::snapshot::{read_snapshot_in, stage_snapshot};

/// Owner of every [`Line`] record.
///
/// Single-record operations commit on their own. The `stage_*` methods add
/// writes to a caller's [`Transaction`] so that multi-record operations
/// (fork, merge) commit as one atomic batch.
pub struct LineageRegistry<S: KvStore> {
    store: Arc<S>,
}

impl<S: KvStore> Clone for LineageRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KvStore> LineageRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a line in `Active` status and return its id.
    pub fn create_line(&self, new: NewLine) -> RegistryResult<LineId> {
        let mut txn = Transaction::new(self.store.as_ref());
        let line = self.stage_create_line(&mut txn, new)?;
        txn.commit()?;
        info!(
            line = %line.id,
            parent = ?line.parent_line_id,
            origin = ?line.origin_snapshot_id,
            "line created"
        );
        Ok(line.id)
    }

    /// Stage the creation of a line.
    ///
    /// For a branch this checks that the parent is forkable and the origin
    /// snapshot exists on it, copies its state, indexes the child under the parent and
    /// increments the parent's branch counter.
    pub fn stage_create_line(
        &self,
        txn: &mut Transaction<'_, S>,
        new: NewLine,
    ) -> RegistryResult<Line> {
        let NewLine {
            name,
            parent_line_id,
            origin_snapshot_id,
            state,
            metadata,
        } = new;
        let id = LineId::new();

        let (branch_state, initial_state) = match (parent_line_id, origin_snapshot_id) {
            (None, None) => (None, state.unwrap_or_default()),
            (Some(parent), Some(origin)) => {
                if state.is_some() {
                    return Err(RegistryError::InvalidAncestry(
                        "a branch takes its state from its origin snapshot".into(),
                    ));
                }
                let parent_line = match load_line(txn, &parent) {
                    Ok(line) => line,
                    Err(RegistryError::NotFound { .. }) => {
                        return Err(RegistryError::InvalidAncestry(format!(
                            "parent line {parent} does not exist"
                        )))
                    }
                    Err(e) => return Err(e),
                };
                ensure_forkable(&parent_line)?;
                let snapshot = read_snapshot_in(txn, &parent, origin)?.ok_or_else(|| {
                    RegistryError::InvalidAncestry(format!(
                        "snapshot {origin} does not exist on line {parent}"
                    ))
                })?;

                txn.put(Namespace::Children, &keys::child(&parent, &id), Vec::new());
                txn.increment(Namespace::Counters, &keys::branch_counter(&parent), 1);
                (Some(snapshot.state), State::new())
            }
            (None, Some(origin)) => {
                return Err(RegistryError::InvalidAncestry(format!(
                    "origin snapshot {origin} given without a parent line"
                )))
            }
            (Some(parent), None) => {
                return Err(RegistryError::InvalidAncestry(format!(
                    "a branch of {parent} needs an origin snapshot"
                )))
            }
        };

        let now = lineage_types::now();
        let mut line = Line {
            id,
            name,
            status: LineStatus::Active,
            status_reason: None,
            parent_line_id,
            origin_snapshot_id,
            state: branch_state.unwrap_or_default(),
            snapshot_count: 0,
            branch_count: 0,
            metadata,
            created_at: now,
            updated_at: now,
        };

        txn.expect_absent(Namespace::Lines, &keys::line(&id))?;
        if line.is_branch() || initial_state == State::default() {
            put_record(txn, &line)?;
        } else {
            // Root lines record their initial state as snapshot #1 so that
            // replay reproduces it.
            stage_snapshot(txn, &mut line, INIT_STEP, initial_state)?;
        }

        debug!(line = %id, branch = line.is_branch(), "staged line creation");
        Ok(line)
    }

    pub fn get_line(&self, id: &LineId) -> RegistryResult<Line> {
        self.find_line(id)?
            .ok_or_else(|| RegistryError::line_not_found(id))
    }

    pub fn find_line(&self, id: &LineId) -> RegistryResult<Option<Line>> {
        let record: Option<LineRecord> =
            read_json(self.store.as_ref(), Namespace::Lines, &keys::line(id))?;
        match record {
            Some(record) => Ok(Some(self.join_counters(record)?)),
            None => Ok(None),
        }
    }

    /// Every line, ordered by id.
    pub fn list_lines(&self) -> RegistryResult<Vec<Line>> {
        let mut lines = Vec::new();
        for (key, bytes) in self.store.scan(Namespace::Lines, "")? {
            let record: LineRecord = lineage_store::decode_json(Namespace::Lines, &key, &bytes)?;
            lines.push(self.join_counters(record)?);
        }
        Ok(lines)
    }

    /// Ids of the lines forked directly from `id`, ordered by id.
    pub fn children(&self, id: &LineId) -> RegistryResult<Vec<LineId>> {
        let prefix = keys::children_prefix(id);
        self.store
            .scan(Namespace::Children, &prefix)?
            .into_iter()
            .map(|(key, _)| {
                let child = &key[prefix.len()..];
                LineId::from_str(child)
                    .map_err(|e| RegistryError::Serialization(format!("child index {key}: {e}")))
            })
            .collect()
    }

    /// Move a line to `to`, recording `reason`. `Merged` is rejected: only a
    /// merge commit may write it.
    pub fn transition_status(
        &self,
        id: &LineId,
        to: LineStatus,
        reason: Option<String>,
    ) -> RegistryResult<Line> {
        let mut txn = Transaction::new(self.store.as_ref());
        let mut line = load_line(&mut txn, id)?;
        let from = line.status;
        self.stage_status(&mut txn, &mut line, to, reason)?;
        txn.commit()?;
        info!(line = %id, %from, %to, "line status changed");
        Ok(line)
    }

    pub fn stage_status(
        &self,
        txn: &mut Transaction<'_, S>,
        line: &mut Line,
        to: LineStatus,
        reason: Option<String>,
    ) -> RegistryResult<()> {
        if to == LineStatus::Merged || !line.status.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                from: line.status,
                to,
            });
        }
        line.status = to;
        line.status_reason = reason;
        line.updated_at = lineage_types::now();
        put_record(txn, line)
    }

    /// Stage the `Merged` transition of a branch line.
    pub fn stage_mark_merged(
        &self,
        txn: &mut Transaction<'_, S>,
        line: &mut Line,
    ) -> RegistryResult<()> {
        if !line.status.can_merge(line.is_branch()) {
            return Err(RegistryError::InvalidTransition {
                from: line.status,
                to: LineStatus::Merged,
            });
        }
        line.status = LineStatus::Merged;
        line.updated_at = lineage_types::now();
        put_record(txn, line)
    }

    /// Overwrite a line's materialized state without a snapshot, breaking
    /// replay on purpose. Only tests use it.
    #[cfg(test)]
    pub(crate) fn stage_state(
        &self,
        txn: &mut Transaction<'_, S>,
        line: &mut Line,
        state: State,
    ) -> RegistryResult<()> {
        line.state = state;
        line.updated_at = lineage_types::now();
        put_record(txn, line)
    }

    /// Read a line inside a transaction, guarding the observed record.
    pub fn load_line(&self, txn: &mut Transaction<'_, S>, id: &LineId) -> RegistryResult<Line> {
        load_line(txn, id)
    }

    /// Atomically bump one of a line's counters.
    pub fn increment_counter(&self, id: &LineId, counter: Counter) -> RegistryResult<u64> {
        if self.store.get(Namespace::Lines, &keys::line(id))?.is_none() {
            return Err(RegistryError::line_not_found(id));
        }
        let key = counter_key(id, counter);
        let value = self.store.increment(Namespace::Counters, &key, 1)?;
        debug!(line = %id, counter = counter.as_str(), value, "counter incremented");
        Ok(value)
    }

    fn join_counters(&self, record: LineRecord) -> RegistryResult<Line> {
        let snapshots = self
            .store
            .counter(Namespace::Counters, &keys::snapshot_counter(&record.id))?;
        let branches = self
            .store
            .counter(Namespace::Counters, &keys::branch_counter(&record.id))?;
        Ok(Line::from_record(record, snapshots, branches))
    }
}

/// Fail with `NotForkable` unless `line` may be forked.
pub fn ensure_forkable(line: &Line) -> RegistryResult<()> {
    if line.status.is_forkable() {
        Ok(())
    } else {
        Err(RegistryError::NotForkable {
            id: line.id,
            status: line.status,
        })
    }
}

pub(crate) fn load_line<S: KvStore + ?Sized>(
    txn: &mut Transaction<'_, S>,
    id: &LineId,
) -> RegistryResult<Line> {
    let record: LineRecord = txn
        .get_json(Namespace::Lines, &keys::line(id))?
        .ok_or_else(|| RegistryError::line_not_found(id))?;
    let snapshots = txn.counter(Namespace::Counters, &keys::snapshot_counter(id))?;
    let branches = txn.counter(Namespace::Counters, &keys::branch_counter(id))?;
    Ok(Line::from_record(record, snapshots, branches))
}

pub(crate) fn put_record<S: KvStore + ?Sized>(
    txn: &mut Transaction<'_, S>,
    line: &Line,
) -> RegistryResult<()> {
    txn.put_json(Namespace::Lines, &keys::line(&line.id), &line.to_record())?;
    Ok(())
}

fn counter_key(id: &LineId, counter: Counter) -> String {
    match counter {
        Counter::Snapshots => keys::snapshot_counter(id),
        Counter::Branches => keys::branch_counter(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SnapshotLog;
    use lineage_store::InMemoryKvStore;
    use lineage_types::SnapshotId;

    fn setup() -> (LineageRegistry<InMemoryKvStore>, SnapshotLog<InMemoryKvStore>) {
        let store = Arc::new(InMemoryKvStore::new());
        (
            LineageRegistry::new(Arc::clone(&store)),
            SnapshotLog::new(store),
        )
    }

    #[test]
    fn create_root_line() {
        let (registry, _) = setup();
        let id = registry
            .create_line(NewLine::root().with_name("main").with_metadata("owner", "ops"))
            .unwrap();
        let line = registry.get_line(&id).unwrap();
        assert_eq!(line.status, LineStatus::Active);
        assert_eq!(line.name.as_deref(), Some("main"));
        assert_eq!(line.metadata.get("owner").map(String::as_str), Some("ops"));
        assert_eq!(line.snapshot_count, 0);
        assert!(!line.is_branch());
        assert!(line.state.is_empty());
    }

    #[test]
    fn initial_state_becomes_first_snapshot() {
        let (registry, log) = setup();
        let state = State::new().with("x", 1);
        let id = registry
            .create_line(NewLine::root().with_state(state.clone()))
            .unwrap();
        let line = registry.get_line(&id).unwrap();
        assert_eq!(line.state, state);
        assert_eq!(line.snapshot_count, 1);
        let first = log.get_snapshot(&id, SnapshotId::FIRST).unwrap();
        assert_eq!(first.step_kind, INIT_STEP);
        assert_eq!(first.state, state);
    }

    #[test]
    fn empty_versioned_state_keeps_its_version() {
        let (registry, log) = setup();
        let state = State {
            version: 3,
            ..State::default()
        };
        let id = registry
            .create_line(NewLine::root().with_state(state.clone()))
            .unwrap();
        let line = registry.get_line(&id).unwrap();
        assert_eq!(line.state.version, 3);
        assert_eq!(line.snapshot_count, 1);
        assert_eq!(log.replay(&id).unwrap().state, state);
    }

    #[test]
    fn branch_requires_existing_origin() {
        let (registry, log) = setup();
        let parent = registry.create_line(NewLine::root()).unwrap();

        let err = registry
            .create_line(NewLine::branch(parent, SnapshotId::FIRST))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidAncestry(_)));

        let err = registry
            .create_line(NewLine {
                origin_snapshot_id: Some(SnapshotId::FIRST),
                ..NewLine::default()
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidAncestry(_)));

        let err = registry
            .create_line(NewLine {
                parent_line_id: Some(parent),
                ..NewLine::default()
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidAncestry(_)));

        let err = registry
            .create_line(NewLine::branch(LineId::new(), SnapshotId::FIRST))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidAncestry(_)));

        log.append_snapshot(&parent, "step", State::new().with("x", 1))
            .unwrap();
        let child = registry
            .create_line(NewLine::branch(parent, SnapshotId::FIRST))
            .unwrap();
        let child_line = registry.get_line(&child).unwrap();
        assert_eq!(child_line.state, State::new().with("x", 1));
        assert_eq!(child_line.parent_line_id, Some(parent));
        assert_eq!(registry.get_line(&parent).unwrap().branch_count, 1);
        assert_eq!(registry.children(&parent).unwrap(), vec![child]);
    }

    #[test]
    fn branch_rejects_explicit_state() {
        let (registry, log) = setup();
        let parent = registry.create_line(NewLine::root()).unwrap();
        log.append_snapshot(&parent, "step", State::new()).unwrap();
        let err = registry
            .create_line(NewLine::branch(parent, SnapshotId::FIRST).with_state(State::new()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidAncestry(_)));
    }

    #[test]
    fn status_machine_is_enforced() {
        let (registry, _) = setup();
        let id = registry.create_line(NewLine::root()).unwrap();

        let line = registry
            .transition_status(&id, LineStatus::Paused, None)
            .unwrap();
        assert_eq!(line.status, LineStatus::Paused);
        assert!(line.updated_at >= line.created_at);

        let err = registry
            .transition_status(&id, LineStatus::Merged, None)
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidTransition {
                to: LineStatus::Merged,
                ..
            }
        ));

        let err = registry
            .transition_status(&id, LineStatus::Paused, None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        registry
            .transition_status(&id, LineStatus::Failed, Some("IterationLimitExceeded".into()))
            .unwrap();
        let line = registry.get_line(&id).unwrap();
        assert_eq!(line.status_reason.as_deref(), Some("IterationLimitExceeded"));
        assert!(registry
            .transition_status(&id, LineStatus::Active, None)
            .is_err());
    }

    #[test]
    fn only_branches_can_be_marked_merged() {
        let (registry, log) = setup();
        let root = registry.create_line(NewLine::root()).unwrap();
        log.append_snapshot(&root, "step", State::new()).unwrap();
        let branch = registry
            .create_line(NewLine::branch(root, SnapshotId::FIRST))
            .unwrap();

        let store = registry.store();
        let mut txn = Transaction::new(store);
        let mut root_line = registry.load_line(&mut txn, &root).unwrap();
        assert!(registry.stage_mark_merged(&mut txn, &mut root_line).is_err());
        let mut branch_line = registry.load_line(&mut txn, &branch).unwrap();
        registry
            .stage_mark_merged(&mut txn, &mut branch_line)
            .unwrap();
        txn.commit().unwrap();

        assert_eq!(
            registry.get_line(&branch).unwrap().status,
            LineStatus::Merged
        );
    }

    #[test]
    fn counters_and_missing_lines() {
        let (registry, _) = setup();
        let id = registry.create_line(NewLine::root()).unwrap();
        assert_eq!(registry.increment_counter(&id, Counter::Branches).unwrap(), 1);
        assert_eq!(registry.increment_counter(&id, Counter::Branches).unwrap(), 2);
        assert_eq!(registry.get_line(&id).unwrap().branch_count, 2);

        let missing = LineId::new();
        assert!(matches!(
            registry.get_line(&missing),
            Err(RegistryError::NotFound { .. })
        ));
        assert!(registry.find_line(&missing).unwrap().is_none());
        assert!(registry
            .increment_counter(&missing, Counter::Snapshots)
            .is_err());
    }

    #[test]
    fn forkable_predicate() {
        let (registry, _) = setup();
        let id = registry.create_line(NewLine::root()).unwrap();
        assert!(ensure_forkable(&registry.get_line(&id).unwrap()).is_ok());
        let done = registry
            .transition_status(&id, LineStatus::Completed, None)
            .unwrap();
        assert!(matches!(
            ensure_forkable(&done),
            Err(RegistryError::NotForkable { .. })
        ));
    }

    #[test]
    fn branch_of_closed_parent_is_not_forkable() {
        let (registry, _) = setup();
        let parent = registry
            .create_line(NewLine::root().with_state(State::new().with("x", 1)))
            .unwrap();
        registry
            .transition_status(&parent, LineStatus::Completed, None)
            .unwrap();

        let err = registry
            .create_line(NewLine::branch(parent, SnapshotId::FIRST))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::NotForkable {
                status: LineStatus::Completed,
                ..
            }
        ));
        assert_eq!(registry.get_line(&parent).unwrap().branch_count, 0);
        assert!(registry.children(&parent).unwrap().is_empty());
        assert_eq!(registry.list_lines().unwrap().len(), 1);
    }

    #[test]
    fn list_lines_includes_everything() {
        let (registry, _) = setup();
        let a = registry.create_line(NewLine::root()).unwrap();
        let b = registry.create_line(NewLine::root()).unwrap();
        let ids: Vec<LineId> = registry.list_lines().unwrap().into_iter().map(|l| l.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&b));
    }
}
