//! Kernel storage: the buffered key-value layer every kernel component writes
//! through, the blob store beside it, and the crank hash over consensus writes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use vatk_cbor::Hash;
use vatk_store::{
    BufferedKv, DynStore, FsStore, KvObserver, KvStore, MemKv, MemStore, SqliteKv,
};

use crate::{BundleStore, KernelResult, SnapStore, StorageOptions, TranscriptStore};

pub const ACTIVITY_HASH_KEY: &str = "activityhash";

/// How a key participates in consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Hashed into the crank hash and included in exports.
    Consensus,
    /// `local.` keys: node-specific, not hashed.
    Local,
    /// `host.` keys: owned by the host application, not hashed.
    Host,
}

pub fn key_type(key: &str) -> KeyType {
    if key.starts_with("local.") {
        KeyType::Local
    } else if key.starts_with("host.") {
        KeyType::Host
    } else {
        KeyType::Consensus
    }
}

/// Hashes every staged consensus write of the current crank.
#[derive(Default)]
struct CrankHasher {
    hasher: Mutex<Sha256>,
}

impl CrankHasher {
    fn counts(key: &str) -> bool {
        key != ACTIVITY_HASH_KEY && key_type(key) == KeyType::Consensus
    }

    fn finish(&self) -> String {
        let hasher = std::mem::take(&mut *self.hasher.lock().unwrap());
        hex::encode(hasher.finalize())
    }
}

impl KvObserver for CrankHasher {
    fn on_pending_set(&self, key: &str, value: &str) {
        if Self::counts(key) {
            let mut h = self.hasher.lock().unwrap();
            for part in ["add", key, value] {
                h.update(part.as_bytes());
                h.update(b"\n");
            }
        }
    }

    fn on_pending_delete(&self, key: &str) {
        if Self::counts(key) {
            let mut h = self.hasher.lock().unwrap();
            for part in ["delete", key] {
                h.update(part.as_bytes());
                h.update(b"\n");
            }
        }
    }

    fn on_abort(&self) {
        *self.hasher.lock().unwrap() = Sha256::new();
    }
}

/// Crank and activity hashes produced by [`KernelStorage::emit_crank_hashes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrankHashes {
    pub crank_hash: String,
    pub activity_hash: String,
}

/// Shared handle to kernel storage. Clones refer to the same buffer.
#[derive(Clone)]
pub struct KernelStorage {
    kv: Arc<Mutex<BufferedKv>>,
    blobs: DynStore,
    crank: Arc<CrankHasher>,
    /// Blob deletions staged by this crank. The blob store has no
    /// transactions, so they run only once the key-value batch commits.
    doomed_blobs: Arc<Mutex<BTreeSet<Hash>>>,
    options: StorageOptions,
}

impl std::fmt::Debug for KernelStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelStorage")
            .field("kv", &*self.kv.lock().unwrap())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl KernelStorage {
    /// Fails with `StorageApiViolation` if `backing` lacks a required operation.
    pub fn new(
        backing: Box<dyn KvStore>,
        blobs: DynStore,
        options: StorageOptions,
    ) -> KernelResult<Self> {
        let crank = Arc::new(CrankHasher::default());
        let kv = BufferedKv::with_observer(backing, crank.clone())?;
        Ok(Self {
            kv: Arc::new(Mutex::new(kv)),
            blobs,
            crank,
            doomed_blobs: Arc::default(),
            options,
        })
    }

    pub fn in_memory() -> KernelResult<Self> {
        Self::new(
            Box::new(MemKv::new()),
            Arc::new(MemStore::new()),
            StorageOptions::default(),
        )
    }

    /// SQLite key-value file and filesystem blob store under `dir`.
    pub fn open(dir: impl AsRef<Path>, options: StorageOptions) -> KernelResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let kv = SqliteKv::open(dir)?;
        let blobs = FsStore::open(dir)?;
        Self::new(Box::new(kv), Arc::new(blobs), options)
    }

    pub fn options(&self) -> StorageOptions {
        self.options
    }

    pub fn blobs(&self) -> &DynStore {
        &self.blobs
    }

    /// Store a blob. A deletion of the same content staged earlier in the
    /// crank is withdrawn.
    pub fn put_blob(&self, bytes: &[u8]) -> KernelResult<Hash> {
        let hash = self.blobs.put_blob(bytes)?;
        self.doomed_blobs.lock().unwrap().remove(&hash);
        Ok(hash)
    }

    /// Delete a blob when the current crank commits. An abort keeps it.
    pub fn delete_blob_on_commit(&self, hash: Hash) {
        self.doomed_blobs.lock().unwrap().insert(hash);
    }

    pub fn transcripts(&self) -> TranscriptStore {
        TranscriptStore::new(self.clone())
    }

    pub fn snapshots(&self) -> SnapStore {
        SnapStore::new(self.clone())
    }

    pub fn bundles(&self) -> BundleStore {
        BundleStore::new(self.clone())
    }

    pub fn has(&self, key: &str) -> KernelResult<bool> {
        Ok(self.kv.lock().unwrap().has(key)?)
    }

    pub fn get(&self, key: &str) -> KernelResult<Option<String>> {
        Ok(self.kv.lock().unwrap().get(key)?)
    }

    pub fn set(&self, key: &str, value: &str) -> KernelResult<()> {
        Ok(self.kv.lock().unwrap().set(key, value)?)
    }

    pub fn delete(&self, key: &str) -> KernelResult<()> {
        Ok(self.kv.lock().unwrap().delete(key)?)
    }

    /// Keys in `[start, end)` in ascending order, pending writes included.
    pub fn get_keys(&self, start: &str, end: &str) -> KernelResult<Vec<String>> {
        Ok(self.kv.lock().unwrap().get_keys(start, end)?)
    }

    /// Keys beginning with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> KernelResult<Vec<String>> {
        self.get_keys(prefix, &prefix_end(prefix))
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> KernelResult<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> KernelResult<()> {
        self.set(key, &serde_json::to_string(value)?)
    }

    pub fn get_u64(&self, key: &str) -> KernelResult<Option<u64>> {
        match self.get(key)? {
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                crate::KernelError::Transcript(format!("key {key} holds non-numeric {raw:?}"))
            }),
            None => Ok(None),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.kv.lock().unwrap().has_pending()
    }

    /// End the crank: make every pending write durable, then delete the
    /// blobs the committed state no longer refers to.
    pub fn commit(&self) -> KernelResult<()> {
        self.kv.lock().unwrap().commit()?;
        let doomed = std::mem::take(&mut *self.doomed_blobs.lock().unwrap());
        for hash in doomed {
            log::debug!("deleting blob {hash}");
            self.blobs.delete_blob(hash)?;
        }
        Ok(())
    }

    /// Discard every write and staged blob deletion since the last commit.
    pub fn abort(&self) {
        self.kv.lock().unwrap().abort();
        self.doomed_blobs.lock().unwrap().clear();
    }

    /// Finish the crank hash and fold it into the persisted activity hash.
    pub fn emit_crank_hashes(&self) -> KernelResult<CrankHashes> {
        let crank_hash = self.crank.finish();
        let previous = self.get(ACTIVITY_HASH_KEY)?.unwrap_or_default();
        let mut h = Sha256::new();
        for part in [ACTIVITY_HASH_KEY, previous.as_str(), crank_hash.as_str()] {
            h.update(part.as_bytes());
            h.update(b"\n");
        }
        let activity_hash = hex::encode(h.finalize());
        self.set(ACTIVITY_HASH_KEY, &activity_hash)?;
        Ok(CrankHashes {
            crank_hash,
            activity_hash,
        })
    }

    pub fn activity_hash(&self) -> KernelResult<String> {
        Ok(self.get(ACTIVITY_HASH_KEY)?.unwrap_or_default())
    }

    /// Every committed entry, ignoring pending writes.
    pub fn committed_entries(&self) -> KernelResult<BTreeMap<String, String>> {
        let kv = self.kv.lock().unwrap();
        let backing = kv.committed();
        let mut entries = BTreeMap::new();
        for key in backing.get_keys("", "")? {
            if let Some(value) = backing.get(&key)? {
                entries.insert(key, value);
            }
        }
        Ok(entries)
    }
}

/// Smallest string greater than every string starting with `prefix`.
pub(crate) fn prefix_end(prefix: &str) -> String {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return chars.into_iter().collect();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vatk_store::{ReadOnlyKv, Store};

    #[test]
    fn prefix_end_bounds_the_prefix() {
        assert_eq!(prefix_end("vat."), "vat/");
        assert_eq!(prefix_end("v1.vs."), "v1.vs/");
        assert_eq!(prefix_end(""), "");
    }

    #[test]
    fn crank_hash_covers_only_consensus_writes() {
        let a = KernelStorage::in_memory().unwrap();
        let b = KernelStorage::in_memory().unwrap();
        a.set("v1.vs.count", "1").unwrap();
        a.set("local.cache", "x").unwrap();
        b.set("v1.vs.count", "1").unwrap();
        b.set("host.height", "9").unwrap();
        assert_eq!(
            a.emit_crank_hashes().unwrap(),
            b.emit_crank_hashes().unwrap()
        );

        a.delete("v1.vs.count").unwrap();
        let ha = a.emit_crank_hashes().unwrap();
        let hb = b.emit_crank_hashes().unwrap();
        assert_ne!(ha.crank_hash, hb.crank_hash);
        assert_ne!(ha.activity_hash, hb.activity_hash);
        assert_eq!(a.activity_hash().unwrap(), ha.activity_hash);
    }

    #[test]
    fn abort_resets_crank_hash() {
        let a = KernelStorage::in_memory().unwrap();
        let b = KernelStorage::in_memory().unwrap();
        a.set("k", "v").unwrap();
        a.abort();
        assert_eq!(
            a.emit_crank_hashes().unwrap(),
            b.emit_crank_hashes().unwrap()
        );
    }

    #[test]
    fn read_only_backing_is_an_api_violation() {
        let err = KernelStorage::new(
            Box::new(ReadOnlyKv::new(MemKv::new())),
            Arc::new(MemStore::new()),
            StorageOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, crate::KernelError::StorageApiViolation(_)));
        assert!(err.is_kernel_fatal());
    }

    #[test]
    fn blob_deletion_waits_for_commit() {
        let blobs = MemStore::new();
        let storage = KernelStorage::new(
            Box::new(MemKv::new()),
            Arc::new(blobs.clone()),
            StorageOptions::default(),
        )
        .unwrap();
        let kept = storage.put_blob(b"kept").unwrap();
        let dropped = storage.put_blob(b"dropped").unwrap();
        let revived = storage.put_blob(b"revived").unwrap();

        storage.delete_blob_on_commit(kept);
        storage.abort();
        storage.delete_blob_on_commit(dropped);
        storage.delete_blob_on_commit(revived);
        assert_eq!(storage.put_blob(b"revived").unwrap(), revived);
        assert_eq!(blobs.len(), 3);

        storage.commit().unwrap();
        assert!(blobs.has_blob(kept).unwrap());
        assert!(!blobs.has_blob(dropped).unwrap());
        assert!(blobs.has_blob(revived).unwrap());
    }

    #[test]
    fn commit_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = KernelStorage::open(dir.path(), StorageOptions::default()).unwrap();
            storage.set("kept", "1").unwrap();
            storage.commit().unwrap();
            storage.set("dropped", "2").unwrap();
            storage.abort();
        }
        let storage = KernelStorage::open(dir.path(), StorageOptions::default()).unwrap();
        assert_eq!(storage.get("kept").unwrap().as_deref(), Some("1"));
        assert!(!storage.has("dropped").unwrap());
        assert_eq!(storage.committed_entries().unwrap().len(), 1);
    }
}
