use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::batch::{decode_counter, encode_counter, WriteBatch, WriteOp};
use crate::error::{StoreError, StoreResult};
use crate::namespace::Namespace;
use crate::traits::KvStore;

pub(crate) type KeyMap = BTreeMap<(Namespace, String), Vec<u8>>;

/// In-memory, `BTreeMap`-based key/value store.
///
/// Intended for tests and embedding. A batch is applied while holding the
/// write lock, which makes every batch atomic and serializable.
pub struct InMemoryKvStore {
    entries: RwLock<KeyMap>,
    fail_next: AtomicUsize,
}

impl InMemoryKvStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Number of keys across all namespaces.
    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys in one namespace.
    pub fn count(&self, ns: Namespace) -> usize {
        self.entries
            .read()
            .map(|m| m.keys().filter(|(n, _)| *n == ns).count())
            .unwrap_or(0)
    }

    /// Make the next `n` calls to `apply` fail with [`StoreError::Injected`]
    /// without writing anything.
    pub fn fail_next_applies(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, ns: Namespace, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let map = self
            .entries
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        Ok(map.get(&(ns, key.to_string())).cloned())
    }

    fn scan(&self, ns: Namespace, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let map = self
            .entries
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        Ok(scan_map(&map, ns, prefix))
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        if self.take_injected_failure() {
            return Err(StoreError::Injected("apply".into()));
        }
        let mut map = self
            .entries
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        batch.check_guards(|ns, key| map.get(&(ns, key.to_string())).cloned())?;
        let resolved = resolve_ops(&map, batch.into_ops())?;
        commit_resolved(&mut map, resolved);
        Ok(())
    }

    fn increment(&self, ns: Namespace, key: &str, by: u64) -> StoreResult<u64> {
        if self.take_injected_failure() {
            return Err(StoreError::Injected("increment".into()));
        }
        let mut map = self
            .entries
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        let slot = (ns, key.to_string());
        let next = decode_counter(ns, key, map.get(&slot).map(Vec::as_slice))? + by;
        map.insert(slot, encode_counter(next));
        Ok(next)
    }
}

impl std::fmt::Debug for InMemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKvStore")
            .field("key_count", &self.len())
            .finish()
    }
}

pub(crate) fn scan_map(map: &KeyMap, ns: Namespace, prefix: &str) -> Vec<(String, Vec<u8>)> {
    map.range((ns, prefix.to_string())..)
        .take_while(|((n, k), _)| *n == ns && k.starts_with(prefix))
        .map(|((_, k), v)| (k.clone(), v.clone()))
        .collect()
}

/// Turn a batch's ops into plain puts and deletes against the current map,
/// without mutating it. Increments see earlier ops of the same batch.
pub(crate) fn resolve_ops(map: &KeyMap, ops: Vec<WriteOp>) -> StoreResult<Vec<WriteOp>> {
    let mut overlay: HashMap<(Namespace, String), Option<Vec<u8>>> = HashMap::new();
    let mut resolved = Vec::with_capacity(ops.len());

    for op in ops {
        match op {
            WriteOp::Put { ns, key, value } => {
                overlay.insert((ns, key.clone()), Some(value.clone()));
                resolved.push(WriteOp::Put { ns, key, value });
            }
            WriteOp::Delete { ns, key } => {
                overlay.insert((ns, key.clone()), None);
                resolved.push(WriteOp::Delete { ns, key });
            }
            WriteOp::Increment { ns, key, by } => {
                let slot = (ns, key.clone());
                let current = match overlay.get(&slot) {
                    Some(pending) => pending.clone(),
                    None => map.get(&slot).cloned(),
                };
                let next = decode_counter(ns, &key, current.as_deref())? + by;
                let value = encode_counter(next);
                overlay.insert(slot, Some(value.clone()));
                resolved.push(WriteOp::Put { ns, key, value });
            }
        }
    }

    Ok(resolved)
}

/// Apply already-resolved puts and deletes. Infallible by construction.
pub(crate) fn commit_resolved(map: &mut KeyMap, ops: Vec<WriteOp>) {
    for op in ops {
        match op {
            WriteOp::Put { ns, key, value } => {
                map.insert((ns, key), value);
            }
            WriteOp::Delete { ns, key } => {
                map.remove(&(ns, key));
            }
            WriteOp::Increment { .. } => {
                debug_assert!(false, "increments must be resolved before commit");
            }
        }
    }
}
