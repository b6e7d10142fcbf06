use crate::{Store, StoreError, StoreResult, verify};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use vatk_cbor::Hash;

/// In-memory blob store; clones share the same contents.
#[derive(Clone, Default)]
pub struct MemStore {
    blobs: Arc<RwLock<HashMap<Hash, Vec<u8>>>>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("blobs", &self.blobs.read().unwrap().len())
            .finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a stored blob without re-hashing. Only useful for corruption tests.
    pub fn tamper(&self, hash: Hash, bytes: Vec<u8>) {
        self.blobs.write().unwrap().insert(hash, bytes);
    }
}

impl Store for MemStore {
    fn put_blob(&self, bytes: &[u8]) -> StoreResult<Hash> {
        let hash = Hash::of_bytes(bytes);
        let mut guard = self.blobs.write().unwrap();
        guard.entry(hash).or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    fn get_blob(&self, hash: Hash) -> StoreResult<Vec<u8>> {
        let bytes = self
            .blobs
            .read()
            .unwrap()
            .get(&hash)
            .cloned()
            .ok_or(StoreError::Missing(hash))?;
        verify(hash, &bytes)?;
        Ok(bytes)
    }

    fn has_blob(&self, hash: Hash) -> StoreResult<bool> {
        Ok(self.blobs.read().unwrap().contains_key(&hash))
    }

    fn delete_blob(&self, hash: Hash) -> StoreResult<()> {
        self.blobs.write().unwrap().remove(&hash);
        Ok(())
    }
}
