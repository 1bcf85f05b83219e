use lineage_guard::MERGE_STEP;
use lineage_merge::{overwrite, three_way, MergeRecord, MergeResult, MergeStrategy};
use lineage_registry::Line;
use lineage_store::{KvStore, Namespace, Transaction};
use lineage_types::{LineId, MergeId, SnapshotId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::context::OpContext;
use crate::engine::{check_deadline, ensure_finite, Engine};
use crate::error::{AtStep, EngineError, EngineResult};
use crate::history::{EntityType, HistoryAction, HistoryEntry};
use crate::idempotency::{Claim, IdempotentOutcome};

/// A request to fold `source_line_id` into `target_line_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub target_line_id: LineId,
    pub source_line_id: LineId,
    /// `None` uses the configured default strategy.
    #[serde(default)]
    pub strategy: Option<MergeStrategy>,
    /// Merge even when the source is not a direct child of the target.
    #[serde(default)]
    pub allow_unrelated: bool,
}

impl MergeRequest {
    pub fn new(target_line_id: LineId, source_line_id: LineId) -> Self {
        Self {
            target_line_id,
            source_line_id,
            strategy: None,
            allow_unrelated: false,
        }
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn allowing_unrelated(mut self) -> Self {
        self.allow_unrelated = true;
        self
    }
}

fn merge_key(target: &LineId, merge: &MergeId) -> String {
    format!("{target}/{merge}")
}

fn merge_index_key(merge: &MergeId) -> String {
    format!("by-id/{merge}")
}

impl<S: KvStore> Engine<S> {
    /// Merge a source line into a target line.
    ///
    /// Validation failures are reported together before anything is
    /// written. The merge then counts as one `merge` step against the
    /// target's iteration budget; that step stays consumed even if the merge
    /// fails afterwards. The target's new state and snapshot, the merge
    /// record, the source's `Merged` status and the idempotency record
    /// commit as one batch.
    pub async fn merge(&self, request: MergeRequest, ctx: OpContext) -> EngineResult<MergeResult> {
        let deadline = self.deadline(&ctx);
        let strategy = request
            .strategy
            .unwrap_or(self.config.merge.default_strategy);
        let held = self
            .locks
            .lock(
                &[request.target_line_id, request.source_line_id],
                deadline,
                "merge",
            )
            .await?;

        let claim = ctx
            .idempotency_key
            .as_ref()
            .map(|key| Claim::new(key, "merge", &request))
            .transpose()?;
        if let Some(claim) = &claim {
            if let Some(outcome) = claim.lookup(self.store.as_ref())? {
                return outcome.into_merge(claim);
            }
        }

        let mut txn = Transaction::new(self.store.as_ref());
        let (mut target, mut source) = self.validate_merge(&mut txn, &request)?;

        self.guard
            .ensure(&target.id, MERGE_STEP)
            .at_step("check iteration guard")?;
        self.guard
            .record(&target.id, MERGE_STEP)
            .at_step("record merge step")?;

        let (outcome, base_snapshot_id) = match strategy {
            MergeStrategy::Overwrite => (overwrite(&source.state), None),
            MergeStrategy::ThreeWay => {
                let (parent, origin) = branch_point(&source)?;
                let base = self
                    .snapshots
                    .read_in(&mut txn, &parent, origin)
                    .at_step("load merge base")?;
                let outcome = three_way(
                    &base.state,
                    &target.state,
                    &source.state,
                    self.resolver.as_ref(),
                )
                .inspect_err(|e| warn!(target = %target.id, source = %source.id, error = %e, "merge aborted"))?;
                (outcome, Some(origin))
            }
        };

        let merged = self.normalize(outcome.state);
        ensure_finite(&merged)?;
        let snapshot = self
            .snapshots
            .stage_append(&mut txn, &mut target, MERGE_STEP, merged)
            .at_step("stage target snapshot")?;

        let record = MergeRecord {
            id: MergeId::new(),
            timestamp: lineage_types::now(),
            target_line_id: target.id,
            source_line_id: source.id,
            strategy,
            resolver: self.resolver.name().to_string(),
            base_snapshot_id,
            conflicts: outcome.conflicts,
            resulting_snapshot_id: snapshot.id,
        };
        let key = merge_key(&target.id, &record.id);
        txn.expect_absent(Namespace::Merges, &key)
            .at_step("stage merge record")?;
        txn.put_json(Namespace::Merges, &key, &record)
            .at_step("stage merge record")?;
        txn.put_json(Namespace::Merges, &merge_index_key(&record.id), &target.id)
            .at_step("stage merge record")?;

        self.registry
            .stage_mark_merged(&mut txn, &mut source)
            .at_step("mark source merged")?;

        let result = MergeResult::from(&record);
        if let Some(claim) = claim {
            claim.stage(
                &mut txn,
                IdempotentOutcome::Merge {
                    result: result.clone(),
                },
            )?;
        }
        check_deadline(deadline, "merge")?;
        txn.commit().at_step("commit merge")?;
        drop(held);

        info!(
            merge = %record.id,
            target = %record.target_line_id,
            source = %record.source_line_id,
            strategy = %strategy,
            conflicts = record.conflicts.len(),
            snapshot = %record.resulting_snapshot_id,
            "lines merged"
        );
        self.notify(HistoryEntry::new(
            EntityType::Merge,
            record.id,
            HistoryAction::Merged,
            json!({
                "target_line_id": record.target_line_id,
                "source_line_id": record.source_line_id,
                "strategy": strategy,
                "resolver": record.resolver,
                "conflicts": record.conflicts.len(),
                "resulting_snapshot_id": record.resulting_snapshot_id,
            }),
        ))
        .await;
        Ok(result)
    }

    /// Every merge into `target`, oldest first.
    pub fn get_merge_history(&self, target: &LineId) -> EngineResult<Vec<MergeRecord>> {
        self.get_line(target)?;
        let mut records = self
            .store
            .scan(Namespace::Merges, &format!("{target}/"))
            .at_step("scan merge history")?
            .into_iter()
            .map(|(key, bytes)| {
                lineage_store::decode_json::<MergeRecord>(Namespace::Merges, &key, &bytes)
                    .at_step("decode merge record")
            })
            .collect::<EngineResult<Vec<_>>>()?;
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        debug!(target = %target, merges = records.len(), "merge history read");
        Ok(records)
    }

    pub fn get_merge(&self, id: &MergeId) -> EngineResult<MergeRecord> {
        let not_found = || EngineError::NotFound(format!("merge {id}"));
        let target: LineId = lineage_store::read_json(
            self.store.as_ref(),
            Namespace::Merges,
            &merge_index_key(id),
        )
        .at_step("read merge index")?
        .ok_or_else(not_found)?;
        lineage_store::read_json(self.store.as_ref(), Namespace::Merges, &merge_key(&target, id))
            .at_step("read merge record")?
            .ok_or_else(not_found)
    }

    /// Check every merge precondition and report all violations at once.
    fn validate_merge(
        &self,
        txn: &mut Transaction<'_, S>,
        request: &MergeRequest,
    ) -> EngineResult<(Line, Line)> {
        let (target_id, source_id) = (request.target_line_id, request.source_line_id);
        let mut violations = Vec::new();
        if target_id == source_id {
            violations.push(format!("line {target_id} cannot be merged into itself"));
        }

        let target = self.find_in(txn, &target_id)?;
        let source = self.find_in(txn, &source_id)?;

        match &target {
            None => violations.push(format!("target line {target_id} does not exist")),
            Some(t) if !t.status.accepts_merge() => violations.push(format!(
                "target line {target_id} is {}; only active or paused lines accept merges",
                t.status
            )),
            Some(_) => {}
        }

        match &source {
            None => violations.push(format!("source line {source_id} does not exist")),
            Some(s) => {
                if s.status == lineage_types::LineStatus::Merged {
                    violations.push(format!("source line {source_id} is already merged"));
                } else if !s.status.accepts_merge() {
                    violations.push(format!(
                        "source line {source_id} is {}; only active or paused lines can be merged",
                        s.status
                    ));
                }
                if !s.is_branch() {
                    violations.push(format!(
                        "source line {source_id} is a root line and has no branch point"
                    ));
                } else if s.parent_line_id != Some(target_id)
                    && !(request.allow_unrelated || self.config.merge.allow_unrelated)
                {
                    violations.push(format!(
                        "source line {source_id} is not a branch of target line {target_id}"
                    ));
                }
            }
        }

        match (target, source) {
            (Some(target), Some(source)) if violations.is_empty() => Ok((target, source)),
            _ => {
                warn!(target = %target_id, source = %source_id, ?violations, "merge rejected");
                Err(EngineError::Validation { violations })
            }
        }
    }
}

/// The parent line and origin snapshot a branch was forked from.
fn branch_point(line: &Line) -> EngineResult<(LineId, SnapshotId)> {
    match (line.parent_line_id, line.origin_snapshot_id) {
        (Some(parent), Some(origin)) => Ok((parent, origin)),
        _ => Err(EngineError::InvalidAncestry(format!(
            "line {} has no branch point",
            line.id
        ))),
    }
}
