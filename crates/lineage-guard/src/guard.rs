use std::sync::Arc;

use lineage_store::{decode_counter, encode_counter, KvStore, Namespace, Transaction, WriteBatch};
use lineage_types::LineId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GuardConfig;
use crate::error::{GuardError, GuardResult, LimitScope};

/// Step kind recorded for a merge commit on the target line.
pub const MERGE_STEP: &str = "merge";

/// Accepted-step counts for one line and one step kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationCounts {
    pub line_steps: u64,
    pub kind_steps: u64,
}

/// The guard's answer for one prospective step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardDecision {
    Allow(IterationCounts),
    Deny { scope: LimitScope, limit: u64 },
}

impl GuardDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

/// Bounded-execution policy evaluated before each step.
///
/// Counters live in the store's `counters` namespace, apart from the
/// registry's own counters, so they survive restarts with a durable store
/// and no two lines ever share a count. The guard only answers and records;
/// it never changes a line's status.
pub struct IterationGuard<S: KvStore> {
    store: Arc<S>,
    config: GuardConfig,
}

impl<S: KvStore> Clone for IterationGuard<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: KvStore> IterationGuard<S> {
    pub fn new(store: Arc<S>, config: GuardConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Current counts for `line` and `step_kind`.
    pub fn counts(&self, line: &LineId, step_kind: &str) -> GuardResult<IterationCounts> {
        Ok(IterationCounts {
            line_steps: self.store.counter(Namespace::Counters, &line_key(line))?,
            kind_steps: self
                .store
                .counter(Namespace::Counters, &kind_key(line, step_kind))?,
        })
    }

    /// Whether another step of `step_kind` may run on `line`.
    pub fn check(&self, line: &LineId, step_kind: &str) -> GuardResult<bool> {
        Ok(self.decide(line, step_kind)?.is_allowed())
    }

    pub fn decide(&self, line: &LineId, step_kind: &str) -> GuardResult<GuardDecision> {
        let counts = self.counts(line, step_kind)?;
        Ok(self.evaluate(counts, step_kind))
    }

    /// Like [`check`](Self::check), but a denial is an
    /// [`GuardError::IterationLimitExceeded`].
    pub fn ensure(&self, line: &LineId, step_kind: &str) -> GuardResult<IterationCounts> {
        let decision = self.decide(line, step_kind)?;
        self.conclude(line, step_kind, decision)
    }

    /// Count one accepted step. Both counters move in one atomic batch.
    pub fn record(&self, line: &LineId, step_kind: &str) -> GuardResult<IterationCounts> {
        let mut batch = WriteBatch::new();
        batch.increment(Namespace::Counters, line_key(line), 1);
        batch.increment(Namespace::Counters, kind_key(line, step_kind), 1);
        self.store.apply(batch)?;
        let counts = self.counts(line, step_kind)?;
        debug!(
            line = %line,
            step_kind,
            line_steps = counts.line_steps,
            kind_steps = counts.kind_steps,
            "step recorded"
        );
        Ok(counts)
    }

    /// Check and record a step inside a caller's transaction, so the step is
    /// counted exactly when the caller's commit succeeds.
    ///
    /// The counters are read through the transaction, which guards them: a
    /// concurrent step on the same line makes the commit conflict instead of
    /// overshooting the ceiling.
    pub fn stage_record(
        &self,
        txn: &mut Transaction<'_, S>,
        line: &LineId,
        step_kind: &str,
    ) -> GuardResult<IterationCounts> {
        let line_key = line_key(line);
        let kind_key = kind_key(line, step_kind);
        let counts = IterationCounts {
            line_steps: read_counter(txn, &line_key)?,
            kind_steps: read_counter(txn, &kind_key)?,
        };

        let decision = self.evaluate(counts, step_kind);
        self.conclude(line, step_kind, decision)?;

        let next = IterationCounts {
            line_steps: counts.line_steps + 1,
            kind_steps: counts.kind_steps + 1,
        };
        txn.put(Namespace::Counters, &line_key, encode_counter(next.line_steps));
        txn.put(Namespace::Counters, &kind_key, encode_counter(next.kind_steps));
        Ok(next)
    }

    fn evaluate(&self, counts: IterationCounts, step_kind: &str) -> GuardDecision {
        if counts.line_steps >= self.config.max_steps_per_line {
            return GuardDecision::Deny {
                scope: LimitScope::Line,
                limit: self.config.max_steps_per_line,
            };
        }
        if let Some(limit) = self.config.limit_for(step_kind) {
            if counts.kind_steps >= limit {
                return GuardDecision::Deny {
                    scope: LimitScope::StepKind,
                    limit,
                };
            }
        }
        GuardDecision::Allow(counts)
    }

    fn conclude(
        &self,
        line: &LineId,
        step_kind: &str,
        decision: GuardDecision,
    ) -> GuardResult<IterationCounts> {
        match decision {
            GuardDecision::Allow(counts) => Ok(counts),
            GuardDecision::Deny { scope, limit } => {
                warn!(line = %line, step_kind, %scope, limit, "step rejected by iteration guard");
                Err(GuardError::IterationLimitExceeded {
                    line: *line,
                    step_kind: step_kind.to_string(),
                    limit,
                    scope,
                })
            }
        }
    }
}

fn read_counter<S: KvStore + ?Sized>(txn: &mut Transaction<'_, S>, key: &str) -> GuardResult<u64> {
    let raw = txn.get(Namespace::Counters, key)?;
    Ok(decode_counter(Namespace::Counters, key, raw.as_deref())?)
}

fn line_key(line: &LineId) -> String {
    format!("guard/{line}/total")
}

fn kind_key(line: &LineId, step_kind: &str) -> String {
    format!("guard/{line}/kind/{step_kind}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_store::{FileKvStore, FileStoreConfig, InMemoryKvStore};

    fn guard(config: GuardConfig) -> IterationGuard<InMemoryKvStore> {
        IterationGuard::new(Arc::new(InMemoryKvStore::new()), config)
    }

    #[test]
    fn line_ceiling() {
        let guard = guard(GuardConfig::default().with_max_steps(2));
        let line = LineId::new();
        assert!(guard.check(&line, "step").unwrap());
        guard.record(&line, "step").unwrap();
        guard.record(&line, "other").unwrap();
        assert!(!guard.check(&line, "step").unwrap());

        match guard.ensure(&line, "step").unwrap_err() {
            GuardError::IterationLimitExceeded { limit, scope, .. } => {
                assert_eq!(limit, 2);
                assert_eq!(scope, LimitScope::Line);
            }
            other => panic!("expected IterationLimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn step_kind_ceiling_is_independent() {
        let guard = guard(GuardConfig::default().with_step_limit("retry", 1));
        let line = LineId::new();
        guard.record(&line, "retry").unwrap();
        assert!(!guard.check(&line, "retry").unwrap());
        assert!(guard.check(&line, "step").unwrap());
        assert_eq!(
            guard.decide(&line, "retry").unwrap(),
            GuardDecision::Deny {
                scope: LimitScope::StepKind,
                limit: 1
            }
        );
    }

    #[test]
    fn lines_do_not_share_counts() {
        let guard = guard(GuardConfig::default().with_max_steps(1));
        let a = LineId::new();
        let b = LineId::new();
        guard.record(&a, "step").unwrap();
        assert!(!guard.check(&a, "step").unwrap());
        assert!(guard.check(&b, "step").unwrap());
    }

    #[test]
    fn record_bumps_both_counters() {
        let guard = guard(GuardConfig::default());
        let line = LineId::new();
        guard.record(&line, "a").unwrap();
        let counts = guard.record(&line, "b").unwrap();
        assert_eq!(counts.line_steps, 2);
        assert_eq!(counts.kind_steps, 1);
        assert_eq!(guard.counts(&line, "a").unwrap().kind_steps, 1);
    }

    #[test]
    fn staged_record_only_counts_on_commit() {
        let store = Arc::new(InMemoryKvStore::new());
        let guard = IterationGuard::new(Arc::clone(&store), GuardConfig::default().with_max_steps(1));
        let line = LineId::new();

        {
            let mut txn = Transaction::new(store.as_ref());
            guard.stage_record(&mut txn, &line, "step").unwrap();
        }
        assert_eq!(guard.counts(&line, "step").unwrap().line_steps, 0);

        let mut txn = Transaction::new(store.as_ref());
        guard.stage_record(&mut txn, &line, "step").unwrap();
        txn.commit().unwrap();

        let mut txn = Transaction::new(store.as_ref());
        assert!(matches!(
            guard.stage_record(&mut txn, &line, "step"),
            Err(GuardError::IterationLimitExceeded { .. })
        ));
    }

    #[test]
    fn staged_record_conflicts_with_concurrent_step() {
        let store = Arc::new(InMemoryKvStore::new());
        let guard = IterationGuard::new(Arc::clone(&store), GuardConfig::default());
        let line = LineId::new();

        let mut txn = Transaction::new(store.as_ref());
        guard.stage_record(&mut txn, &line, "step").unwrap();
        guard.record(&line, "step").unwrap();
        let err = txn.commit().unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(guard.counts(&line, "step").unwrap().line_steps, 1);
    }

    #[test]
    fn counts_survive_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("guard.wal");
        let line = LineId::new();
        let config = GuardConfig::default().with_max_steps(2);
        {
            let store = Arc::new(FileKvStore::open(&path, FileStoreConfig::default()).unwrap());
            let guard = IterationGuard::new(store, config.clone());
            guard.record(&line, MERGE_STEP).unwrap();
            guard.record(&line, MERGE_STEP).unwrap();
        }
        let store = Arc::new(FileKvStore::open(&path, FileStoreConfig::default()).unwrap());
        let guard = IterationGuard::new(store, config);
        assert!(!guard.check(&line, MERGE_STEP).unwrap());
    }
}
