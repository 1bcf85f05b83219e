//! Retry-safe fork and merge.
//!
//! A request carrying an [`IdempotencyKey`] stores its outcome under that key
//! in the same batch as its effects. Retrying with the same key and the same
//! request returns the stored outcome; reusing the key for a different
//! request is rejected.

use lineage_merge::MergeResult;
use lineage_store::{encode_json, read_json, KvStore, Namespace, Transaction};
use lineage_types::{IdempotencyKey, LineId, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AtStep, EngineError, EngineResult};

/// What a completed idempotent request produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum IdempotentOutcome {
    Fork { line_id: LineId },
    Merge { result: MergeResult },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Hex BLAKE3 digest of the operation name and canonical request.
    pub fingerprint: String,
    pub outcome: IdempotentOutcome,
    pub recorded_at: Timestamp,
}

/// BLAKE3 fingerprint of `request` as issued to `operation`.
///
/// The canonical form is the request's JSON encoding. Request types keep
/// their maps ordered, so equal requests always hash alike.
pub fn fingerprint<T: Serialize>(operation: &str, request: &T) -> EngineResult<String> {
    let canonical = encode_json(request).at_step("fingerprint request")?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(operation.as_bytes());
    hasher.update(&[0]);
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

/// A key claimed by one in-flight request.
#[derive(Debug)]
pub(crate) struct Claim {
    key: IdempotencyKey,
    fingerprint: String,
}

impl Claim {
    pub(crate) fn new<T: Serialize>(
        key: &IdempotencyKey,
        operation: &str,
        request: &T,
    ) -> EngineResult<Self> {
        Ok(Self {
            key: key.clone(),
            fingerprint: fingerprint(operation, request)?,
        })
    }

    /// The stored outcome of an earlier identical request, if any.
    pub(crate) fn lookup<S: KvStore>(&self, store: &S) -> EngineResult<Option<IdempotentOutcome>> {
        let stored: Option<IdempotencyRecord> =
            read_json(store, Namespace::Idempotency, self.key.as_str())
                .at_step("read idempotency record")?;
        match stored {
            None => Ok(None),
            Some(record) if record.fingerprint == self.fingerprint => {
                debug!(key = %self.key, "replaying stored outcome");
                Ok(Some(record.outcome))
            }
            Some(_) => Err(self.reused()),
        }
    }

    pub(crate) fn stage<S: KvStore>(
        self,
        txn: &mut Transaction<'_, S>,
        outcome: IdempotentOutcome,
    ) -> EngineResult<()> {
        let key = self.key.as_str();
        txn.expect_absent(Namespace::Idempotency, key)
            .at_step("claim idempotency key")?;
        let record = IdempotencyRecord {
            fingerprint: self.fingerprint,
            outcome,
            recorded_at: lineage_types::now(),
        };
        txn.put_json(Namespace::Idempotency, key, &record)
            .at_step("stage idempotency record")
    }

    pub(crate) fn reused(&self) -> EngineError {
        EngineError::validation(format!(
            "idempotency key '{}' was already used for a different request",
            self.key
        ))
    }
}

impl IdempotentOutcome {
    pub(crate) fn into_fork(self, claim: &Claim) -> EngineResult<LineId> {
        match self {
            Self::Fork { line_id } => Ok(line_id),
            Self::Merge { .. } => Err(claim.reused()),
        }
    }

    pub(crate) fn into_merge(self, claim: &Claim) -> EngineResult<MergeResult> {
        match self {
            Self::Merge { result } => Ok(result),
            Self::Fork { .. } => Err(claim.reused()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_store::InMemoryKvStore;

    #[derive(Serialize)]
    struct Request {
        line: u32,
        name: &'static str,
    }

    fn key(token: &str) -> IdempotencyKey {
        IdempotencyKey::new(token).unwrap()
    }

    #[test]
    fn fingerprint_depends_on_operation_and_request() {
        let a = fingerprint("fork", &Request { line: 1, name: "a" }).unwrap();
        let b = fingerprint("fork", &Request { line: 1, name: "a" }).unwrap();
        let c = fingerprint("fork", &Request { line: 2, name: "a" }).unwrap();
        let d = fingerprint("merge", &Request { line: 1, name: "a" }).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn stored_outcome_is_returned_for_same_request() {
        let store = InMemoryKvStore::new();
        let request = Request { line: 1, name: "a" };
        let line_id = LineId::new();

        let claim = Claim::new(&key("k1"), "fork", &request).unwrap();
        assert!(claim.lookup(&store).unwrap().is_none());
        let mut txn = Transaction::new(&store);
        claim
            .stage(&mut txn, IdempotentOutcome::Fork { line_id })
            .unwrap();
        txn.commit().unwrap();

        let retry = Claim::new(&key("k1"), "fork", &request).unwrap();
        let outcome = retry.lookup(&store).unwrap().unwrap();
        assert_eq!(outcome.into_fork(&retry).unwrap(), line_id);
    }

    #[test]
    fn reused_key_with_other_request_is_rejected() {
        let store = InMemoryKvStore::new();
        let claim = Claim::new(&key("k2"), "fork", &Request { line: 1, name: "a" }).unwrap();
        let mut txn = Transaction::new(&store);
        claim
            .stage(
                &mut txn,
                IdempotentOutcome::Fork {
                    line_id: LineId::new(),
                },
            )
            .unwrap();
        txn.commit().unwrap();

        let other = Claim::new(&key("k2"), "fork", &Request { line: 1, name: "b" }).unwrap();
        let err = other.lookup(&store).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
