use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::iter::Peekable;
use std::sync::Arc;

use super::{KvError, KvOp, KvResult, KvStore, check_key, in_range};

/// Hooks invoked synchronously by [`BufferedKv`]. Every method defaults to a no-op.
pub trait KvObserver: Send + Sync {
    /// After a read, with the value the reader saw.
    fn on_get(&self, key: &str, value: Option<&str>) {
        let _ = (key, value);
    }

    /// After a write has been staged in the buffer.
    fn on_pending_set(&self, key: &str, value: &str) {
        let _ = (key, value);
    }

    /// After a delete has been staged in the buffer.
    fn on_pending_delete(&self, key: &str) {
        let _ = key;
    }

    /// After pending writes reached the backing store.
    fn on_commit(&self) {}

    /// After pending writes were discarded.
    fn on_abort(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl KvObserver for NoopObserver {}

/// Write buffer over a backing store. Reads see staged writes; nothing reaches
/// the backing store until [`BufferedKv::commit`].
pub struct BufferedKv {
    backing: Box<dyn KvStore>,
    additions: BTreeMap<String, String>,
    deletions: BTreeSet<String>,
    observer: Arc<dyn KvObserver>,
}

impl fmt::Debug for BufferedKv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedKv")
            .field("additions", &self.additions.len())
            .field("deletions", &self.deletions.len())
            .finish()
    }
}

impl BufferedKv {
    /// Wrap `backing`, failing if it lacks any operation the buffer relies on.
    pub fn new(backing: Box<dyn KvStore>) -> KvResult<Self> {
        Self::with_observer(backing, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        backing: Box<dyn KvStore>,
        observer: Arc<dyn KvObserver>,
    ) -> KvResult<Self> {
        let missing: Vec<KvOp> = KvOp::ALL
            .into_iter()
            .filter(|op| !backing.supports(*op))
            .collect();
        if !missing.is_empty() {
            return Err(KvError::ApiViolation { missing });
        }
        Ok(Self {
            backing,
            additions: BTreeMap::new(),
            deletions: BTreeSet::new(),
            observer,
        })
    }

    pub fn set_observer(&mut self, observer: Arc<dyn KvObserver>) {
        self.observer = observer;
    }

    /// Number of staged writes and deletes.
    pub fn pending_len(&self) -> usize {
        self.additions.len() + self.deletions.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_len() > 0
    }

    /// Keys in `[start, end)` as seen through the buffer.
    ///
    /// The staged additions are copied when this is called; writes made while
    /// the returned iterator is alive are not guaranteed to appear in it.
    pub fn keys(&self, start: &str, end: &str) -> KvResult<KeyIter> {
        let additions: Vec<String> = self
            .additions
            .range(start.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| in_range(k, start, end))
            .cloned()
            .collect();
        let backing = self.backing.get_keys(start, end)?;
        Ok(KeyIter {
            additions: additions.into_iter().peekable(),
            backing: backing.into_iter().peekable(),
            deletions: self.deletions.clone(),
        })
    }

    /// Flush staged writes to the backing store as one batch and clear the buffer.
    pub fn commit(&mut self) -> KvResult<()> {
        let mut batch: Vec<(String, Option<String>)> =
            Vec::with_capacity(self.pending_len());
        batch.extend(
            std::mem::take(&mut self.additions)
                .into_iter()
                .map(|(k, v)| (k, Some(v))),
        );
        batch.extend(std::mem::take(&mut self.deletions).into_iter().map(|k| (k, None)));
        log::debug!("kv commit: {} writes", batch.len());
        self.backing.apply_batch(batch)?;
        self.observer.on_commit();
        Ok(())
    }

    /// Discard staged writes without touching the backing store.
    pub fn abort(&mut self) {
        self.additions.clear();
        self.deletions.clear();
        self.observer.on_abort();
    }

    /// Read straight from the backing store, ignoring staged writes.
    pub fn committed(&self) -> &dyn KvStore {
        self.backing.as_ref()
    }
}

impl KvStore for BufferedKv {
    fn has(&self, key: &str) -> KvResult<bool> {
        if self.additions.contains_key(key) {
            return Ok(true);
        }
        if self.deletions.contains(key) {
            return Ok(false);
        }
        self.backing.has(key)
    }

    fn get(&self, key: &str) -> KvResult<Option<String>> {
        let value = if let Some(value) = self.additions.get(key) {
            Some(value.clone())
        } else if self.deletions.contains(key) {
            None
        } else {
            self.backing.get(key)?
        };
        self.observer.on_get(key, value.as_deref());
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> KvResult<()> {
        check_key(key)?;
        self.additions.insert(key.to_string(), value.to_string());
        self.deletions.remove(key);
        self.observer.on_pending_set(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &str) -> KvResult<()> {
        self.additions.remove(key);
        self.deletions.insert(key.to_string());
        self.observer.on_pending_delete(key);
        Ok(())
    }

    fn get_keys(&self, start: &str, end: &str) -> KvResult<Vec<String>> {
        Ok(self.keys(start, end)?.collect())
    }
}

/// Ascending, de-duplicated merge of staged additions with backing keys,
/// skipping keys with a staged delete.
#[derive(Debug)]
pub struct KeyIter {
    additions: Peekable<std::vec::IntoIter<String>>,
    backing: Peekable<std::vec::IntoIter<String>>,
    deletions: BTreeSet<String>,
}

impl Iterator for KeyIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let (take_addition, shadowed) = match (self.additions.peek(), self.backing.peek()) {
                (None, None) => return None,
                (Some(_), None) => (true, false),
                (None, Some(_)) => (false, false),
                (Some(a), Some(b)) => (a <= b, a == b),
            };
            if shadowed {
                self.backing.next();
            }
            if take_addition {
                return self.additions.next();
            }
            let key = self.backing.next()?;
            if !self.deletions.contains(&key) {
                return Some(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemKv, ReadOnlyKv};
    use std::sync::Mutex;

    fn buffered(backing: &MemKv) -> BufferedKv {
        BufferedKv::new(Box::new(backing.clone())).unwrap()
    }

    #[test]
    fn reads_see_pending_writes_before_commit() {
        let backing = MemKv::from_entries([("a", "1"), ("b", "2")]);
        let mut kv = buffered(&backing);
        kv.set("c", "3").unwrap();
        kv.delete("a").unwrap();
        assert_eq!(kv.get("c").unwrap().as_deref(), Some("3"));
        assert!(!kv.has("a").unwrap());
        assert_eq!(backing.get("a").unwrap().as_deref(), Some("1"));
        assert!(!backing.has("c").unwrap());
    }

    #[test]
    fn commit_matches_direct_application() {
        let backing = MemKv::from_entries([("a", "1"), ("b", "2"), ("d", "4")]);
        let mut direct = MemKv::from_entries([("a", "1"), ("b", "2"), ("d", "4")]);
        let mut kv = buffered(&backing);

        let ops: Vec<(&str, Option<&str>)> = vec![
            ("c", Some("3")),
            ("a", None),
            ("c", None),
            ("c", Some("33")),
            ("b", Some("22")),
            ("e", None),
        ];
        for (key, value) in &ops {
            match value {
                Some(v) => {
                    kv.set(key, v).unwrap();
                    direct.set(key, v).unwrap();
                }
                None => {
                    kv.delete(key).unwrap();
                    direct.delete(key).unwrap();
                }
            }
        }
        kv.commit().unwrap();
        assert!(!kv.has_pending());
        assert_eq!(backing.entries(), direct.entries());
    }

    #[test]
    fn abort_leaves_backing_untouched() {
        let backing = MemKv::from_entries([("a", "1")]);
        let before = backing.entries();
        let mut kv = buffered(&backing);
        kv.set("b", "2").unwrap();
        kv.delete("a").unwrap();
        kv.abort();
        assert_eq!(backing.entries(), before);
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("1"));
        assert!(!kv.has("b").unwrap());
    }

    #[test]
    fn get_keys_merges_sorted_and_deduplicated() {
        let backing = MemKv::from_entries([("k1", "x"), ("k3", "x"), ("k5", "x")]);
        let mut kv = buffered(&backing);
        kv.set("k2", "y").unwrap();
        kv.set("k3", "y").unwrap();
        kv.delete("k5").unwrap();
        kv.set("k9", "out of range").unwrap();
        assert_eq!(kv.get_keys("k", "k6").unwrap(), vec!["k1", "k2", "k3"]);
        assert_eq!(kv.get_keys("k2", "").unwrap(), vec!["k2", "k3", "k9"]);
    }

    #[test]
    fn overwritten_backing_keys_appear_once() {
        let backing = MemKv::from_entries([("a", "1"), ("b", "1"), ("c", "1")]);
        let mut kv = buffered(&backing);
        kv.set("a", "2").unwrap();
        kv.set("c", "2").unwrap();
        kv.set("d", "2").unwrap();
        let keys: Vec<String> = kv.keys("", "").unwrap().collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn key_iterator_uses_additions_snapshot() {
        let backing = MemKv::new();
        let mut kv = buffered(&backing);
        kv.set("a", "1").unwrap();
        let iter = kv.keys("", "").unwrap();
        kv.set("b", "2").unwrap();
        assert_eq!(iter.collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn missing_operations_detected_at_construction() {
        let err = BufferedKv::new(Box::new(ReadOnlyKv::new(MemKv::new()))).unwrap_err();
        match err {
            KvError::ApiViolation { missing } => {
                assert_eq!(missing, vec![KvOp::Set, KvOp::Delete]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl KvObserver for Recorder {
        fn on_get(&self, key: &str, _value: Option<&str>) {
            self.0.lock().unwrap().push(format!("get {key}"));
        }
        fn on_pending_set(&self, key: &str, value: &str) {
            self.0.lock().unwrap().push(format!("set {key}={value}"));
        }
        fn on_pending_delete(&self, key: &str) {
            self.0.lock().unwrap().push(format!("delete {key}"));
        }
        fn on_commit(&self) {
            self.0.lock().unwrap().push("commit".into());
        }
        fn on_abort(&self) {
            self.0.lock().unwrap().push("abort".into());
        }
    }

    #[test]
    fn observer_sees_each_stage() {
        let recorder = Arc::new(Recorder::default());
        let mut kv =
            BufferedKv::with_observer(Box::new(MemKv::new()), recorder.clone()).unwrap();
        kv.set("a", "1").unwrap();
        kv.get("a").unwrap();
        kv.commit().unwrap();
        kv.delete("a").unwrap();
        kv.abort();
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["set a=1", "get a", "commit", "delete a", "abort"]
        );
    }
}
