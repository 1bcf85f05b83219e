use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::namespace::Namespace;

/// A precondition checked before a batch is applied.
///
/// `expected == None` means the key must be absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Guard {
    pub ns: Namespace,
    pub key: String,
    pub expected: Option<Vec<u8>>,
}

impl Guard {
    /// Returns `true` if `current` satisfies this guard.
    pub fn holds(&self, current: Option<&[u8]>) -> bool {
        self.expected.as_deref() == current
    }
}

/// A single mutation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put {
        ns: Namespace,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        ns: Namespace,
        key: String,
    },
    /// Add `by` to the counter at `key` (a missing counter counts as zero).
    Increment {
        ns: Namespace,
        key: String,
        by: u64,
    },
}

impl WriteOp {
    pub fn ns(&self) -> Namespace {
        match self {
            Self::Put { ns, .. } | Self::Delete { ns, .. } | Self::Increment { ns, .. } => *ns,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } | Self::Increment { key, .. } => key,
        }
    }
}

/// An atomic unit of writes: all guards hold and every op is applied, or
/// nothing is written.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    guards: Vec<Guard>,
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to currently hold `expected` (`None` = absent).
    pub fn expect(&mut self, ns: Namespace, key: impl Into<String>, expected: Option<Vec<u8>>) {
        self.guards.push(Guard {
            ns,
            key: key.into(),
            expected,
        });
    }

    pub fn put(&mut self, ns: Namespace, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put {
            ns,
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, ns: Namespace, key: impl Into<String>) {
        self.ops.push(WriteOp::Delete {
            ns,
            key: key.into(),
        });
    }

    pub fn increment(&mut self, ns: Namespace, key: impl Into<String>, by: u64) {
        self.ops.push(WriteOp::Increment {
            ns,
            key: key.into(),
            by,
        });
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Returns `true` if the batch has no ops (guards alone write nothing).
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check every guard against `lookup`, returning the first violated one
    /// as a [`StoreError::Conflict`].
    pub fn check_guards<F>(&self, mut lookup: F) -> StoreResult<()>
    where
        F: FnMut(Namespace, &str) -> Option<Vec<u8>>,
    {
        for guard in &self.guards {
            let current = lookup(guard.ns, &guard.key);
            if !guard.holds(current.as_deref()) {
                return Err(StoreError::Conflict {
                    ns: guard.ns,
                    key: guard.key.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Encode a counter value as stored bytes.
pub fn encode_counter(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Decode a stored counter. A missing counter is zero.
pub fn decode_counter(ns: Namespace, key: &str, bytes: Option<&[u8]>) -> StoreResult<u64> {
    match bytes {
        None => Ok(0),
        Some(raw) => {
            let arr: [u8; 8] = raw.try_into().map_err(|_| StoreError::InvalidCounter {
                ns,
                key: key.to_string(),
            })?;
            Ok(u64::from_le_bytes(arr))
        }
    }
}
