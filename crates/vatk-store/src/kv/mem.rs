use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::{KvResult, KvStore, check_key, in_range};

/// In-memory ordered store. Clones share the same map, so a test can keep a
/// handle on the backing contents while the kernel owns another.
#[derive(Debug, Default, Clone)]
pub struct MemKv {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            entries: Arc::new(RwLock::new(map)),
        }
    }

    /// Copy of the current contents.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.entries.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemKv {
    fn has(&self, key: &str) -> KvResult<bool> {
        Ok(self.entries.read().unwrap().contains_key(key))
    }

    fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> KvResult<()> {
        check_key(key)?;
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> KvResult<()> {
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    fn get_keys(&self, start: &str, end: &str) -> KvResult<Vec<String>> {
        let guard = self.entries.read().unwrap();
        Ok(guard
            .range(start.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| in_range(k, start, end))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_come_back_sorted_within_range() {
        let mut kv = MemKv::new();
        for key in ["b.2", "a.1", "b.1", "c.1"] {
            kv.set(key, "x").unwrap();
        }
        assert_eq!(kv.get_keys("b.", "b/").unwrap(), vec!["b.1", "b.2"]);
        assert_eq!(kv.get_keys("b.2", "").unwrap(), vec!["b.2", "c.1"]);
    }

    #[test]
    fn clones_share_contents() {
        let mut kv = MemKv::new();
        let observer = kv.clone();
        kv.set("k", "v").unwrap();
        assert_eq!(observer.get("k").unwrap().as_deref(), Some("v"));
        kv.delete("k").unwrap();
        assert!(!observer.has("k").unwrap());
    }

    #[test]
    fn empty_key_rejected() {
        let mut kv = MemKv::new();
        assert!(kv.set("", "v").is_err());
    }
}
