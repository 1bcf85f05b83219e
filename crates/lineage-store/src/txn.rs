use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::batch::{decode_counter, WriteBatch, WriteOp};
use crate::error::{StoreError, StoreResult};
use crate::namespace::Namespace;
use crate::traits::KvStore;

/// Serialize a record for storage.
pub fn encode_json<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Deserialize a stored record, naming the key in the error.
pub fn decode_json<T: DeserializeOwned>(ns: Namespace, key: &str, bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Serialization(format!("{ns}/{key}: {e}")))
}

/// Read and decode a record directly from a store.
pub fn read_json<S, T>(store: &S, ns: Namespace, key: &str) -> StoreResult<Option<T>>
where
    S: KvStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(ns, key)? {
        Some(bytes) => decode_json(ns, key, &bytes).map(Some),
        None => Ok(None),
    }
}

type Slot = (Namespace, String);

/// An optimistic unit of work over a [`KvStore`].
///
/// Every read of the underlying store records a guard on the bytes it saw.
/// Writes are buffered and visible to later reads in the same transaction.
/// [`commit`](Self::commit) submits everything as one [`WriteBatch`]; if any
/// observed key changed in the meantime the commit fails with
/// [`StoreError::Conflict`] and nothing is written. Dropping the
/// transaction discards it.
pub struct Transaction<'a, S: KvStore + ?Sized> {
    store: &'a S,
    observed: BTreeMap<Slot, Option<Vec<u8>>>,
    pending: BTreeMap<Slot, Option<Vec<u8>>>,
    increments: BTreeMap<Slot, u64>,
    batch: WriteBatch,
}

impl<'a, S: KvStore + ?Sized> Transaction<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            observed: BTreeMap::new(),
            pending: BTreeMap::new(),
            increments: BTreeMap::new(),
            batch: WriteBatch::new(),
        }
    }

    /// The store this transaction reads from.
    pub fn store(&self) -> &'a S {
        self.store
    }

    /// Read a value, preferring this transaction's own writes.
    pub fn get(&mut self, ns: Namespace, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let slot = (ns, key.to_string());
        if let Some(pending) = self.pending.get(&slot) {
            return Ok(pending.clone());
        }
        self.observe(slot)
    }

    /// Read and decode a record.
    pub fn get_json<T: DeserializeOwned>(
        &mut self,
        ns: Namespace,
        key: &str,
    ) -> StoreResult<Option<T>> {
        match self.get(ns, key)? {
            Some(bytes) => decode_json(ns, key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Require `key` to be absent at commit time.
    pub fn expect_absent(&mut self, ns: Namespace, key: &str) -> StoreResult<()> {
        match self.get(ns, key)? {
            None => Ok(()),
            Some(_) => Err(StoreError::Conflict {
                ns,
                key: key.to_string(),
            }),
        }
    }

    pub fn put(&mut self, ns: Namespace, key: &str, value: Vec<u8>) {
        let slot = (ns, key.to_string());
        self.increments.remove(&slot);
        self.pending.insert(slot, Some(value.clone()));
        self.batch.put(ns, key, value);
    }

    pub fn put_json<T: Serialize>(&mut self, ns: Namespace, key: &str, value: &T) -> StoreResult<()> {
        let bytes = encode_json(value)?;
        self.put(ns, key, bytes);
        Ok(())
    }

    pub fn delete(&mut self, ns: Namespace, key: &str) {
        let slot = (ns, key.to_string());
        self.increments.remove(&slot);
        self.pending.insert(slot, None);
        self.batch.delete(ns, key);
    }

    /// Stage a blind counter increment. No guard is recorded, so concurrent
    /// increments of the same counter never conflict.
    pub fn increment(&mut self, ns: Namespace, key: &str, by: u64) {
        *self.increments.entry((ns, key.to_string())).or_default() += by;
        self.batch.increment(ns, key, by);
    }

    /// Read a counter including this transaction's staged increments.
    ///
    /// The committed part is read without a guard; counters only move
    /// forward through increments.
    pub fn counter(&self, ns: Namespace, key: &str) -> StoreResult<u64> {
        let slot = (ns, key.to_string());
        let base = match self.pending.get(&slot) {
            Some(pending) => decode_counter(ns, key, pending.as_deref())?,
            None => self.store.counter(ns, key)?,
        };
        Ok(base + self.increments.get(&slot).copied().unwrap_or(0))
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Turn the transaction into the batch it would commit.
    pub fn into_batch(self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for ((ns, key), expected) in self.observed {
            batch.expect(ns, key, expected);
        }
        for op in self.batch.into_ops() {
            match op {
                WriteOp::Put { ns, key, value } => batch.put(ns, key, value),
                WriteOp::Delete { ns, key } => batch.delete(ns, key),
                WriteOp::Increment { ns, key, by } => batch.increment(ns, key, by),
            }
        }
        batch
    }

    /// Apply every staged write atomically.
    pub fn commit(self) -> StoreResult<()> {
        let store = self.store;
        let batch = self.into_batch();
        debug!(
            guards = batch.guards().len(),
            ops = batch.len(),
            "committing transaction"
        );
        if batch.is_empty() {
            return Ok(());
        }
        store.apply(batch)
    }

    fn observe(&mut self, slot: Slot) -> StoreResult<Option<Vec<u8>>> {
        if let Some(seen) = self.observed.get(&slot) {
            return Ok(seen.clone());
        }
        let value = self.store.get(slot.0, &slot.1)?;
        self.observed.insert(slot, value.clone());
        Ok(value)
    }
}
