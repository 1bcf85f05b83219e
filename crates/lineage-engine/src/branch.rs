use std::collections::BTreeMap;

use lineage_registry::{ensure_forkable, NewLine};
use lineage_store::{KvStore, Transaction};
use lineage_types::{CheckpointRef, LineId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::context::OpContext;
use crate::engine::{check_deadline, Engine};
use crate::error::{AtStep, EngineError, EngineResult};
use crate::history::{EntityType, HistoryAction, HistoryEntry};
use crate::idempotency::{Claim, IdempotentOutcome};

/// A request to branch a line at one of its snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkRequest {
    pub source_line_id: LineId,
    pub checkpoint: CheckpointRef,
    pub branch_name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ForkRequest {
    pub fn new(source_line_id: LineId, checkpoint: CheckpointRef, branch_name: impl Into<String>) -> Self {
        Self {
            source_line_id,
            checkpoint,
            branch_name: branch_name.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl<S: KvStore> Engine<S> {
    /// Branch `source_line_id` at a checkpoint.
    ///
    /// The new line starts `Active` with the checkpoint's state, and the
    /// source's `branch_count` grows by one, in one atomic batch. The source
    /// line is otherwise untouched, and nothing is visible until the batch
    /// commits.
    pub async fn fork(&self, request: ForkRequest, ctx: OpContext) -> EngineResult<LineId> {
        if request.branch_name.trim().is_empty() {
            return Err(EngineError::validation("branch name must not be empty"));
        }
        let deadline = self.deadline(&ctx);
        let held = self
            .locks
            .lock(&[request.source_line_id], deadline, "fork")
            .await?;

        let claim = ctx
            .idempotency_key
            .as_ref()
            .map(|key| Claim::new(key, "fork", &request))
            .transpose()?;
        if let Some(claim) = &claim {
            if let Some(outcome) = claim.lookup(self.store.as_ref())? {
                return outcome.into_fork(claim);
            }
        }

        let mut txn = Transaction::new(self.store.as_ref());
        let source = self
            .registry
            .load_line(&mut txn, &request.source_line_id)
            .at_step("load source line")?;
        ensure_forkable(&source).at_step("check source status")?;
        let origin = self
            .snapshots
            .resolve_in(&mut txn, &source, request.checkpoint)
            .at_step("resolve checkpoint")?;

        let new = NewLine {
            metadata: request.metadata.clone(),
            ..NewLine::branch(source.id, origin).with_name(request.branch_name.clone())
        };
        let branch = self
            .registry
            .stage_create_line(&mut txn, new)
            .at_step("stage branch")?;
        if let Some(claim) = claim {
            claim.stage(&mut txn, IdempotentOutcome::Fork { line_id: branch.id })?;
        }
        check_deadline(deadline, "fork")?;
        txn.commit().at_step("commit fork")?;
        drop(held);

        info!(
            source = %source.id,
            branch = %branch.id,
            origin = %origin,
            name = %request.branch_name,
            "line forked"
        );
        self.notify(HistoryEntry::new(
            EntityType::Line,
            branch.id,
            HistoryAction::Forked,
            json!({
                "source_line_id": source.id,
                "origin_snapshot_id": origin,
                "branch_name": request.branch_name,
            }),
        ))
        .await;
        Ok(branch.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_store::InMemoryKvStore;
    use lineage_types::{IdempotencyKey, LineStatus, SnapshotId, State};
    use std::sync::Arc;

    async fn engine_with_root() -> (Engine<InMemoryKvStore>, LineId) {
        let engine = Engine::builder(Arc::new(InMemoryKvStore::new()))
            .build()
            .unwrap();
        let root = engine
            .create_line(
                lineage_registry::NewLine::root().with_state(State::new().with("x", 1)),
                OpContext::default(),
            )
            .await
            .unwrap();
        engine
            .append_snapshot(&root, "step", State::new().with("x", 2), OpContext::default())
            .await
            .unwrap();
        (engine, root)
    }

    #[tokio::test]
    async fn fork_copies_checkpoint_state() {
        let (engine, root) = engine_with_root().await;
        let branch = engine
            .fork(
                ForkRequest::new(root, CheckpointRef::Snapshot(SnapshotId::FIRST), "explore")
                    .with_metadata("owner", "planner"),
                OpContext::default(),
            )
            .await
            .unwrap();

        let line = engine.get_line(&branch).unwrap();
        assert_eq!(line.status, LineStatus::Active);
        assert_eq!(line.parent_line_id, Some(root));
        assert_eq!(line.origin_snapshot_id, Some(SnapshotId::FIRST));
        assert_eq!(line.state, State::new().with("x", 1));
        assert_eq!(line.name.as_deref(), Some("explore"));
        assert_eq!(line.metadata.get("owner").map(String::as_str), Some("planner"));
        assert_eq!(engine.get_line(&root).unwrap().branch_count, 1);
        assert_eq!(engine.children(&root).unwrap(), vec![branch]);
    }

    #[tokio::test]
    async fn latest_resolves_to_newest_snapshot() {
        let (engine, root) = engine_with_root().await;
        let branch = engine
            .fork(
                ForkRequest::new(root, CheckpointRef::Latest, "tip"),
                OpContext::default(),
            )
            .await
            .unwrap();
        let line = engine.get_line(&branch).unwrap();
        assert_eq!(line.origin_snapshot_id, Some(SnapshotId::new(2)));
        assert_eq!(line.state, State::new().with("x", 2));
    }

    #[tokio::test]
    async fn terminal_source_is_not_forkable() {
        let (engine, root) = engine_with_root().await;
        engine
            .transition_status(&root, LineStatus::Completed, None, OpContext::default())
            .await
            .unwrap();
        let err = engine
            .fork(
                ForkRequest::new(root, CheckpointRef::Latest, "late"),
                OpContext::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_forkable");
        assert_eq!(engine.get_line(&root).unwrap().branch_count, 0);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_not_found() {
        let (engine, root) = engine_with_root().await;
        let err = engine
            .fork(
                ForkRequest::new(root, CheckpointRef::Snapshot(SnapshotId::new(9)), "ghost"),
                OpContext::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(engine.children(&root).unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_branch_name_is_invalid() {
        let (engine, root) = engine_with_root().await;
        let err = engine
            .fork(ForkRequest::new(root, CheckpointRef::Latest, ""), OpContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn idempotent_retry_returns_same_branch() {
        let (engine, root) = engine_with_root().await;
        let key = IdempotencyKey::new("fork-1").unwrap();
        let request = ForkRequest::new(root, CheckpointRef::Latest, "retry");
        let ctx = OpContext::new().with_idempotency_key(key.clone());

        let first = engine.fork(request.clone(), ctx.clone()).await.unwrap();
        let second = engine.fork(request, ctx.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.get_line(&root).unwrap().branch_count, 1);

        let err = engine
            .fork(ForkRequest::new(root, CheckpointRef::Latest, "other"), ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
