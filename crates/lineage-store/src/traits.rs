use crate::batch::{decode_counter, encode_counter, WriteBatch};
use crate::error::StoreResult;
use crate::namespace::Namespace;

/// Namespaced key/value store.
///
/// All implementations must satisfy these invariants:
/// - `apply` is atomic: either every guard holds and every op is applied, or
///   the store is unchanged.
/// - Concurrent `apply` calls are serializable.
/// - `scan` returns entries in ascending key order.
/// - The store never interprets values, except counters touched by
///   [`crate::WriteOp::Increment`], which are 8-byte little-endian `u64`s.
/// - All I/O errors are propagated, never silently ignored.
pub trait KvStore: Send + Sync {
    /// Read a value. Returns `Ok(None)` if the key does not exist.
    fn get(&self, ns: Namespace, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// List all `(key, value)` pairs in `ns` whose key starts with `prefix`,
    /// in ascending key order.
    fn scan(&self, ns: Namespace, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Atomically apply a batch.
    fn apply(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Write a single value.
    fn put(&self, ns: Namespace, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(ns, key, value);
        self.apply(batch)
    }

    /// Delete a key. Returns `true` if it existed.
    fn delete(&self, ns: Namespace, key: &str) -> StoreResult<bool> {
        loop {
            let Some(current) = self.get(ns, key)? else {
                return Ok(false);
            };
            let mut batch = WriteBatch::new();
            batch.expect(ns, key, Some(current));
            batch.delete(ns, key);
            match self.apply(batch) {
                Ok(()) => return Ok(true),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Atomically replace `expected` with `new`. Returns `false` if the
    /// current value did not match.
    fn compare_and_swap(
        &self,
        ns: Namespace,
        key: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> StoreResult<bool> {
        let mut batch = WriteBatch::new();
        batch.expect(ns, key, expected);
        batch.put(ns, key, new);
        match self.apply(batch) {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read a counter (missing = 0).
    fn counter(&self, ns: Namespace, key: &str) -> StoreResult<u64> {
        let raw = self.get(ns, key)?;
        decode_counter(ns, key, raw.as_deref())
    }

    /// Atomically add `by` to a counter and return the new value.
    ///
    /// The default implementation is a compare-and-swap loop; backends that
    /// can increment under their own lock override it.
    fn increment(&self, ns: Namespace, key: &str, by: u64) -> StoreResult<u64> {
        loop {
            let raw = self.get(ns, key)?;
            let next = decode_counter(ns, key, raw.as_deref())? + by;
            if self.compare_and_swap(ns, key, raw, encode_counter(next))? {
                return Ok(next);
            }
        }
    }
}

impl<T: KvStore + ?Sized> KvStore for std::sync::Arc<T> {
    fn get(&self, ns: Namespace, key: &str) -> StoreResult<Option<Vec<u8>>> {
        (**self).get(ns, key)
    }

    fn scan(&self, ns: Namespace, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        (**self).scan(ns, prefix)
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        (**self).apply(batch)
    }

    fn increment(&self, ns: Namespace, key: &str, by: u64) -> StoreResult<u64> {
        (**self).increment(ns, key, by)
    }
}
