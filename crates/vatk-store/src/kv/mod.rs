//! String key-value storage: the trait every backing store implements, an
//! in-memory and a SQLite backend, and the buffering layer the kernel writes
//! through between commits.
//!
//! Keys are compared by their UTF-8 bytes. For the ASCII keys the kernel
//! writes this is the same order as UTF-16 code-unit comparison.

mod buffered;
mod mem;
mod sqlite;

pub use buffered::{BufferedKv, KeyIter, KvObserver, NoopObserver};
pub use mem::MemKv;
pub use sqlite::SqliteKv;

use std::fmt;
use thiserror::Error;

pub type KvResult<T> = Result<T, KvError>;

/// Operations a backing store must provide for the kernel to use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KvOp {
    Has,
    Get,
    Set,
    Delete,
    GetKeys,
}

impl KvOp {
    pub const ALL: [KvOp; 5] = [KvOp::Has, KvOp::Get, KvOp::Set, KvOp::Delete, KvOp::GetKeys];
}

impl fmt::Display for KvOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KvOp::Has => "has",
            KvOp::Get => "get",
            KvOp::Set => "set",
            KvOp::Delete => "delete",
            KvOp::GetKeys => "getKeys",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("storage object is missing required operations: {}", join_ops(.missing))]
    ApiViolation { missing: Vec<KvOp> },
    #[error("operation '{0}' is not supported by this store")]
    Unsupported(KvOp),
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

fn join_ops(ops: &[KvOp]) -> String {
    ops.iter().map(|op| op.to_string()).collect::<Vec<_>>().join(", ")
}

/// A string-keyed, string-valued store with ordered key iteration.
pub trait KvStore: Send {
    fn has(&self, key: &str) -> KvResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn get(&self, key: &str) -> KvResult<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> KvResult<()>;

    fn delete(&mut self, key: &str) -> KvResult<()>;

    /// Keys `k` with `start <= k < end`, ascending. An empty `end` means no upper bound.
    fn get_keys(&self, start: &str, end: &str) -> KvResult<Vec<String>>;

    /// Apply a batch of writes (`None` deletes). Backends with transactions
    /// override this so the batch lands atomically.
    fn apply_batch(&mut self, batch: Vec<(String, Option<String>)>) -> KvResult<()> {
        for (key, value) in batch {
            match value {
                Some(value) => self.set(&key, &value)?,
                None => self.delete(&key)?,
            }
        }
        Ok(())
    }

    /// Whether this store implements `op`. Checked once when the kernel takes
    /// ownership of the store.
    fn supports(&self, op: KvOp) -> bool {
        let _ = op;
        true
    }
}

impl<K: KvStore + ?Sized> KvStore for Box<K> {
    fn has(&self, key: &str) -> KvResult<bool> {
        (**self).has(key)
    }

    fn get(&self, key: &str) -> KvResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> KvResult<()> {
        (**self).set(key, value)
    }

    fn delete(&mut self, key: &str) -> KvResult<()> {
        (**self).delete(key)
    }

    fn get_keys(&self, start: &str, end: &str) -> KvResult<Vec<String>> {
        (**self).get_keys(start, end)
    }

    fn apply_batch(&mut self, batch: Vec<(String, Option<String>)>) -> KvResult<()> {
        (**self).apply_batch(batch)
    }

    fn supports(&self, op: KvOp) -> bool {
        (**self).supports(op)
    }
}

/// Read-only view over another store. Writes fail with `Unsupported`, and the
/// store reports it cannot `set` or `delete`.
#[derive(Debug, Clone)]
pub struct ReadOnlyKv<K> {
    inner: K,
}

impl<K: KvStore> ReadOnlyKv<K> {
    pub fn new(inner: K) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> K {
        self.inner
    }
}

impl<K: KvStore> KvStore for ReadOnlyKv<K> {
    fn has(&self, key: &str) -> KvResult<bool> {
        self.inner.has(key)
    }

    fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.inner.get(key)
    }

    fn set(&mut self, _key: &str, _value: &str) -> KvResult<()> {
        Err(KvError::Unsupported(KvOp::Set))
    }

    fn delete(&mut self, _key: &str) -> KvResult<()> {
        Err(KvError::Unsupported(KvOp::Delete))
    }

    fn get_keys(&self, start: &str, end: &str) -> KvResult<Vec<String>> {
        self.inner.get_keys(start, end)
    }

    fn supports(&self, op: KvOp) -> bool {
        !matches!(op, KvOp::Set | KvOp::Delete) && self.inner.supports(op)
    }
}

pub(crate) fn check_key(key: &str) -> KvResult<()> {
    if key.is_empty() {
        return Err(KvError::InvalidKey(key.to_string()));
    }
    Ok(())
}

pub(crate) fn in_range(key: &str, start: &str, end: &str) -> bool {
    key >= start && (end.is_empty() || key < end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_view_rejects_writes() {
        let mut backing = MemKv::new();
        backing.set("a", "1").unwrap();
        let mut view = ReadOnlyKv::new(backing);
        assert_eq!(view.get("a").unwrap().as_deref(), Some("1"));
        assert!(matches!(view.set("b", "2"), Err(KvError::Unsupported(KvOp::Set))));
        assert!(!view.supports(KvOp::Delete));
        assert!(view.supports(KvOp::GetKeys));
    }

    #[test]
    fn range_bounds_are_half_open() {
        assert!(in_range("b", "b", "c"));
        assert!(!in_range("c", "b", "c"));
        assert!(in_range("zzz", "b", ""));
        assert!(!in_range("a", "b", ""));
    }
}
