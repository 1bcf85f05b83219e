use std::sync::Arc;

use lineage_guard::IterationGuard;
use lineage_merge::{diff_states, ConflictResolver, SourceWins, StateDiff};
use lineage_registry::{
    Line, LineReport, LineageRegistry, NewLine, RegistryError, ReplayResult, Snapshot, SnapshotLog,
};
use lineage_store::{KvStore, Transaction};
use lineage_types::{CheckpointRef, LineId, LineStatus, SnapshotId, State};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::OpContext;
use crate::error::{AtStep, EngineError, EngineResult};
use crate::history::{EntityType, HistoryAction, HistoryEntry, HistoryRecorder, NoopHistory};
use crate::locks::LineLocks;

/// The lineage engine.
///
/// Owns the registry, snapshot log, iteration guard and merge machinery over
/// one shared store. Every write path runs under the per-line locks of the
/// lines it touches and commits as a single atomic batch, so a failed call
/// leaves nothing behind. Share it across tasks behind an `Arc`.
pub struct Engine<S: KvStore> {
    pub(crate) store: Arc<S>,
    pub(crate) registry: LineageRegistry<S>,
    pub(crate) snapshots: SnapshotLog<S>,
    pub(crate) guard: IterationGuard<S>,
    pub(crate) resolver: Arc<dyn ConflictResolver>,
    history: Arc<dyn HistoryRecorder>,
    pub(crate) locks: LineLocks,
    pub(crate) config: EngineConfig,
}

pub struct EngineBuilder<S: KvStore> {
    store: Arc<S>,
    config: EngineConfig,
    resolver: Arc<dyn ConflictResolver>,
    history: Arc<dyn HistoryRecorder>,
}

impl<S: KvStore> EngineBuilder<S> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Conflict resolver for three-way merges. Defaults to [`SourceWins`].
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// History sink. Defaults to [`NoopHistory`].
    pub fn history(mut self, history: Arc<dyn HistoryRecorder>) -> Self {
        self.history = history;
        self
    }

    pub fn build(self) -> EngineResult<Engine<S>> {
        self.config.validate()?;
        let store = self.store;
        Ok(Engine {
            registry: LineageRegistry::new(Arc::clone(&store)),
            snapshots: SnapshotLog::new(Arc::clone(&store)),
            guard: IterationGuard::new(Arc::clone(&store), self.config.guard.clone()),
            store,
            resolver: self.resolver,
            history: self.history,
            locks: LineLocks::new(),
            config: self.config,
        })
    }
}

impl<S: KvStore> Engine<S> {
    pub fn builder(store: Arc<S>) -> EngineBuilder<S> {
        EngineBuilder {
            store,
            config: EngineConfig::default(),
            resolver: Arc::new(SourceWins),
            history: Arc::new(NoopHistory),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn locks(&self) -> &LineLocks {
        &self.locks
    }

    pub fn guard(&self) -> &IterationGuard<S> {
        &self.guard
    }

    pub fn resolver_name(&self) -> &str {
        self.resolver.name()
    }

    // Lines

    /// Create a root line, or a branch when `new` names a parent.
    pub async fn create_line(&self, new: NewLine, ctx: OpContext) -> EngineResult<LineId> {
        let deadline = self.deadline(&ctx);
        let parent: Vec<LineId> = new.parent_line_id.into_iter().collect();
        let held = self.locks.lock(&parent, deadline, "create_line").await?;

        let new = NewLine {
            state: new.state.map(|state| self.normalize(state)),
            ..new
        };
        if let Some(state) = &new.state {
            ensure_finite(state)?;
        }
        let mut txn = Transaction::new(self.store.as_ref());
        let line = self
            .registry
            .stage_create_line(&mut txn, new)
            .at_step("stage line")?;
        check_deadline(deadline, "create_line")?;
        txn.commit().at_step("commit line")?;
        drop(held);

        info!(
            line = %line.id,
            parent = ?line.parent_line_id,
            origin = ?line.origin_snapshot_id,
            "line created"
        );
        self.notify(HistoryEntry::new(
            EntityType::Line,
            line.id,
            HistoryAction::Created,
            json!({
                "name": line.name,
                "parent_line_id": line.parent_line_id,
                "origin_snapshot_id": line.origin_snapshot_id,
            }),
        ))
        .await;
        Ok(line.id)
    }

    pub fn get_line(&self, id: &LineId) -> EngineResult<Line> {
        self.registry.get_line(id).at_step("read line")
    }

    pub fn list_lines(&self) -> EngineResult<Vec<Line>> {
        self.registry.list_lines().at_step("list lines")
    }

    /// Direct branches of a line.
    pub fn children(&self, id: &LineId) -> EngineResult<Vec<LineId>> {
        self.registry.children(id).at_step("list children")
    }

    /// Move a line through its status machine. `Merged` is only reachable
    /// through [`merge`](Self::merge).
    pub async fn transition_status(
        &self,
        id: &LineId,
        to: LineStatus,
        reason: Option<String>,
        ctx: OpContext,
    ) -> EngineResult<Line> {
        let deadline = self.deadline(&ctx);
        let held = self.locks.lock(&[*id], deadline, "transition_status").await?;

        let mut txn = Transaction::new(self.store.as_ref());
        let mut line = self.registry.load_line(&mut txn, id).at_step("load line")?;
        let from = line.status;
        self.registry
            .stage_status(&mut txn, &mut line, to, reason)
            .at_step("stage status")?;
        check_deadline(deadline, "transition_status")?;
        txn.commit().at_step("commit status")?;
        drop(held);

        info!(line = %id, %from, %to, reason = ?line.status_reason, "line status changed");
        self.notify(HistoryEntry::new(
            EntityType::Line,
            id,
            HistoryAction::StatusChanged,
            json!({ "from": from, "to": to, "reason": line.status_reason }),
        ))
        .await;
        Ok(line)
    }

    /// Mark a line `Failed`, typically after the iteration guard stopped it.
    pub async fn fail_line(
        &self,
        id: &LineId,
        reason: impl Into<String>,
        ctx: OpContext,
    ) -> EngineResult<Line> {
        self.transition_status(id, LineStatus::Failed, Some(reason.into()), ctx)
            .await
    }

    // Snapshots

    /// Record one step of a line.
    ///
    /// The step is checked against and counted by the iteration guard in the
    /// same batch as the snapshot, so a rejected step appends nothing and an
    /// appended snapshot is always counted.
    pub async fn append_snapshot(
        &self,
        id: &LineId,
        step_kind: &str,
        state: State,
        ctx: OpContext,
    ) -> EngineResult<Snapshot> {
        if step_kind.trim().is_empty() {
            return Err(EngineError::validation("step kind must not be empty"));
        }
        ensure_finite(&state)?;
        let deadline = self.deadline(&ctx);
        let held = self.locks.lock(&[*id], deadline, "append_snapshot").await?;

        let mut txn = Transaction::new(self.store.as_ref());
        let mut line = self.registry.load_line(&mut txn, id).at_step("load line")?;
        if line.status.is_terminal() {
            return Err(EngineError::LineClosed {
                line: line.id,
                status: line.status,
            });
        }
        self.guard
            .stage_record(&mut txn, id, step_kind)
            .at_step("record step")?;
        let snapshot = self
            .snapshots
            .stage_append(&mut txn, &mut line, step_kind, self.normalize(state))
            .at_step("stage snapshot")?;
        check_deadline(deadline, "append_snapshot")?;
        txn.commit().at_step("commit snapshot")?;
        drop(held);

        debug!(line = %id, snapshot = %snapshot.id, step_kind, "snapshot appended");
        Ok(snapshot)
    }

    /// Every snapshot of a line, oldest first.
    pub fn list_snapshots(&self, id: &LineId) -> EngineResult<Vec<Snapshot>> {
        self.snapshots.list_snapshots(id).at_step("list snapshots")
    }

    pub fn get_snapshot(&self, id: &LineId, snapshot: SnapshotId) -> EngineResult<Snapshot> {
        self.snapshots
            .get_snapshot(id, snapshot)
            .at_step("read snapshot")
    }

    pub fn resolve_checkpoint(
        &self,
        id: &LineId,
        checkpoint: CheckpointRef,
    ) -> EngineResult<SnapshotId> {
        self.snapshots
            .resolve(id, checkpoint)
            .at_step("resolve checkpoint")
    }

    /// Field changes between two checkpoints of a line.
    pub fn diff_snapshots(
        &self,
        id: &LineId,
        from: CheckpointRef,
        to: CheckpointRef,
    ) -> EngineResult<StateDiff> {
        let old = self.get_snapshot(id, self.resolve_checkpoint(id, from)?)?;
        let new = self.get_snapshot(id, self.resolve_checkpoint(id, to)?)?;
        let diff = diff_states(&old.state, &new.state);
        debug!(line = %id, from = %old.id, to = %new.id, changes = diff.len(), "snapshots compared");
        Ok(diff)
    }

    // Audit

    /// Rebuild a line's state from the root of its ancestry.
    pub fn replay_line(&self, id: &LineId) -> EngineResult<ReplayResult> {
        self.snapshots.replay(id).at_step("replay line")
    }

    /// Check a line's stored history against its record.
    pub fn verify_line(&self, id: &LineId) -> EngineResult<LineReport> {
        let report = self.snapshots.validate_line(id).at_step("verify line")?;
        if !report.is_consistent() {
            warn!(line = %id, violations = report.violations.len(), "line failed verification");
        }
        Ok(report)
    }

    // Internals

    pub(crate) fn deadline(&self, ctx: &OpContext) -> Instant {
        ctx.deadline_or(self.config.default_timeout())
    }

    pub(crate) fn normalize(&self, state: State) -> State {
        match &self.config.schema {
            Some(schema) => schema.normalize(state),
            None => state,
        }
    }

    /// Load a line inside `txn`, mapping absence to `None`.
    pub(crate) fn find_in(
        &self,
        txn: &mut Transaction<'_, S>,
        id: &LineId,
    ) -> EngineResult<Option<Line>> {
        match self.registry.load_line(txn, id) {
            Ok(line) => Ok(Some(line)),
            Err(RegistryError::NotFound { .. }) => Ok(None),
            Err(e) => Err::<Option<Line>, _>(e).at_step("load line"),
        }
    }

    /// Report a committed change. Failures are logged and otherwise ignored.
    pub(crate) async fn notify(&self, entry: HistoryEntry) {
        let action = entry.action.as_str();
        let entity = entry.entity_id.clone();
        match tokio::time::timeout(self.config.default_timeout(), self.history.record(entry)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%entity, action, error = %e, "history recorder failed"),
            Err(_) => warn!(%entity, action, "history recorder timed out"),
        }
    }
}

/// Fail with `Timeout` once `deadline` has passed. Called right before
/// commit, so a timed-out operation never writes.
pub(crate) fn check_deadline(deadline: Instant, operation: &'static str) -> EngineResult<()> {
    if Instant::now() >= deadline {
        warn!(operation, "deadline passed before commit");
        return Err(EngineError::Timeout { operation });
    }
    Ok(())
}

/// Reject states holding NaN or infinite floats, which cannot be stored
/// faithfully.
pub(crate) fn ensure_finite(state: &State) -> EngineResult<()> {
    let fields = state.non_finite_fields();
    if fields.is_empty() {
        return Ok(());
    }
    Err(EngineError::Validation {
        violations: fields
            .iter()
            .map(|field| format!("field {field} holds a non-finite number"))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use lineage_guard::GuardConfig;
    use lineage_store::InMemoryKvStore;
    use lineage_types::StateSchema;
    use std::time::Duration;

    fn engine(config: EngineConfig) -> Engine<InMemoryKvStore> {
        Engine::builder(Arc::new(InMemoryKvStore::new()))
            .config(config)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_append() {
        let engine = engine(EngineConfig::default());
        let line = engine
            .create_line(
                NewLine::root().with_state(State::new().with("x", 1)),
                OpContext::default(),
            )
            .await
            .unwrap();
        let snapshot = engine
            .append_snapshot(&line, "step", State::new().with("x", 2), OpContext::default())
            .await
            .unwrap();
        assert_eq!(snapshot.id, SnapshotId::new(2));

        let stored = engine.get_line(&line).unwrap();
        assert_eq!(stored.state, State::new().with("x", 2));
        assert_eq!(stored.snapshot_count, 2);
        assert!(engine.verify_line(&line).unwrap().is_consistent());
    }

    #[tokio::test]
    async fn guard_rejection_appends_nothing() {
        let engine = engine(EngineConfig::default().with_guard(GuardConfig::default().with_max_steps(1)));
        let line = engine
            .create_line(NewLine::root(), OpContext::default())
            .await
            .unwrap();
        engine
            .append_snapshot(&line, "step", State::new().with("n", 1), OpContext::default())
            .await
            .unwrap();
        let err = engine
            .append_snapshot(&line, "step", State::new().with("n", 2), OpContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "iteration_limit_exceeded");
        assert_eq!(engine.list_snapshots(&line).unwrap().len(), 1);
        assert_eq!(engine.get_line(&line).unwrap().state, State::new().with("n", 1));
    }

    #[tokio::test]
    async fn closed_line_rejects_snapshots() {
        let engine = engine(EngineConfig::default());
        let line = engine
            .create_line(NewLine::root(), OpContext::default())
            .await
            .unwrap();
        engine
            .fail_line(&line, "gave up", OpContext::default())
            .await
            .unwrap();
        let err = engine
            .append_snapshot(&line, "step", State::new(), OpContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LineClosed { .. }));
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(engine.guard().counts(&line, "step").unwrap().line_steps, 0);
    }

    #[tokio::test]
    async fn create_line_cannot_branch_a_closed_line() {
        let engine = engine(EngineConfig::default());
        let root = engine
            .create_line(
                NewLine::root().with_state(State::new().with("x", 1)),
                OpContext::default(),
            )
            .await
            .unwrap();
        engine
            .transition_status(&root, LineStatus::Completed, None, OpContext::default())
            .await
            .unwrap();

        let err = engine
            .create_line(NewLine::branch(root, SnapshotId::FIRST), OpContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_forkable");
        assert_eq!(engine.get_line(&root).unwrap().branch_count, 0);
        assert!(engine.children(&root).unwrap().is_empty());
    }

    #[tokio::test]
    async fn diff_between_checkpoints() {
        let engine = engine(EngineConfig::default());
        let line = engine
            .create_line(
                NewLine::root().with_state(State::new().with("x", 1).with("y", 2)),
                OpContext::default(),
            )
            .await
            .unwrap();
        engine
            .append_snapshot(&line, "step", State::new().with("x", 5).with("z", true), OpContext::default())
            .await
            .unwrap();

        let diff = engine
            .diff_snapshots(&line, CheckpointRef::Snapshot(SnapshotId::FIRST), CheckpointRef::Latest)
            .unwrap();
        assert_eq!(diff.modifications(), 1);
        assert_eq!(diff.removals(), 1);
        assert_eq!(diff.additions(), 1);
        assert!(engine
            .diff_snapshots(&line, CheckpointRef::Latest, CheckpointRef::Latest)
            .unwrap()
            .is_empty());

        let err = engine
            .diff_snapshots(&line, CheckpointRef::Snapshot(SnapshotId::new(9)), CheckpointRef::Latest)
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn non_finite_floats_are_rejected() {
        let engine = engine(EngineConfig::default());
        let err = engine
            .create_line(
                NewLine::root().with_state(State::new().with("x", f64::NAN)),
                OpContext::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(engine.list_lines().unwrap().is_empty());

        let line = engine
            .create_line(NewLine::root(), OpContext::default())
            .await
            .unwrap();
        let err = engine
            .append_snapshot(&line, "step", State::new().with("x", f64::INFINITY), OpContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(engine.list_snapshots(&line).unwrap().is_empty());
        assert_eq!(engine.guard().counts(&line, "step").unwrap().line_steps, 0);

        let snapshot = engine
            .append_snapshot(&line, "step", State::new().with("x", 0.5), OpContext::default())
            .await
            .unwrap();
        assert_eq!(engine.get_snapshot(&line, snapshot.id).unwrap(), snapshot);
    }

    #[tokio::test]
    async fn empty_step_kind_is_invalid() {
        let engine = engine(EngineConfig::default());
        let line = engine
            .create_line(NewLine::root(), OpContext::default())
            .await
            .unwrap();
        let err = engine
            .append_snapshot(&line, "  ", State::new(), OpContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn status_transitions_follow_the_machine() {
        let engine = engine(EngineConfig::default());
        let line = engine
            .create_line(NewLine::root(), OpContext::default())
            .await
            .unwrap();
        let paused = engine
            .transition_status(&line, LineStatus::Paused, None, OpContext::default())
            .await
            .unwrap();
        assert_eq!(paused.status, LineStatus::Paused);

        let err = engine
            .transition_status(&line, LineStatus::Merged, None, OpContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");

        let failed = engine
            .fail_line(&line, "budget", OpContext::default())
            .await
            .unwrap();
        assert_eq!(failed.status_reason.as_deref(), Some("budget"));
        let err = engine
            .transition_status(&line, LineStatus::Active, None, OpContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: LineStatus::Failed,
                to: LineStatus::Active
            }
        ));
    }

    #[tokio::test]
    async fn unknown_line_is_not_found() {
        let engine = engine(EngineConfig::default());
        let missing = LineId::new();
        assert_eq!(engine.get_line(&missing).unwrap_err().kind(), "not_found");
        assert_eq!(engine.list_snapshots(&missing).unwrap_err().kind(), "not_found");
        let err = engine
            .append_snapshot(&missing, "step", State::new(), OpContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn expired_deadline_writes_nothing() {
        let engine = engine(EngineConfig::default());
        let line = engine
            .create_line(NewLine::root(), OpContext::default())
            .await
            .unwrap();
        let ctx = OpContext::new().with_deadline(Instant::now() - Duration::from_millis(1));
        let err = engine
            .append_snapshot(&line, "step", State::new().with("x", 1), ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(engine.list_snapshots(&line).unwrap().is_empty());
    }

    #[tokio::test]
    async fn schema_normalizes_stored_states() {
        let engine = engine(EngineConfig::default().with_schema(StateSchema::new(2, ["x"])));
        let line = engine
            .create_line(NewLine::root(), OpContext::default())
            .await
            .unwrap();
        let snapshot = engine
            .append_snapshot(
                &line,
                "step",
                State::new().with("x", 1).with("legacy", true),
                OpContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(snapshot.state.version, 2);
        assert_eq!(snapshot.state.field("x"), Some(&lineage_types::StateValue::Int(1)));
        assert!(snapshot.state.field("legacy").is_none());
        assert!(snapshot.state.extra.contains_key("legacy"));
    }

    #[tokio::test]
    async fn history_sees_creation() {
        let history = Arc::new(MemoryHistory::new());
        let engine = Engine::builder(Arc::new(InMemoryKvStore::new()))
            .history(history.clone())
            .build()
            .unwrap();
        let line = engine
            .create_line(NewLine::root().with_name("main"), OpContext::default())
            .await
            .unwrap();
        let entries = history.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity_id, line.to_string());
        assert_eq!(entries[0].action, HistoryAction::Created);
    }

    #[test]
    fn invalid_config_fails_build() {
        let config = EngineConfig {
            default_timeout_ms: 0,
            ..EngineConfig::default()
        };
        let err = Engine::builder(Arc::new(InMemoryKvStore::new()))
            .config(config)
            .build()
            .err()
            .unwrap();
        assert_eq!(err.kind(), "config");
    }
}
