use crate::{Store, StoreError, StoreResult, io_error, verify};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use vatk_cbor::Hash;

/// One file per blob under `<root>/blobs`, fanned out by the first byte of
/// the digest: `blobs/ab/cdef...`.
#[derive(Clone)]
pub struct FsStore {
    blobs_dir: PathBuf,
}

impl fmt::Debug for FsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStore")
            .field("blobs_dir", &self.blobs_dir)
            .finish()
    }
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let blobs_dir = root.as_ref().join("blobs");
        fs::create_dir_all(&blobs_dir).map_err(|e| io_error(&blobs_dir, e))?;
        Ok(Self { blobs_dir })
    }

    fn write_once(path: &Path, bytes: &[u8]) -> StoreResult<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }
        // Blobs only appear under their final name once fully synced.
        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| io_error(&tmp, e))?;
        file.write_all(bytes).map_err(|e| io_error(&tmp, e))?;
        file.sync_all().map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| io_error(path, e))
    }

    fn blob_path(&self, hash: &Hash) -> PathBuf {
        let digits = hex::encode(hash.as_bytes());
        let (fan, rest) = digits.split_at(2);
        self.blobs_dir.join(fan).join(rest)
    }
}

impl Store for FsStore {
    fn put_blob(&self, bytes: &[u8]) -> StoreResult<Hash> {
        let hash = Hash::of_bytes(bytes);
        Self::write_once(&self.blob_path(&hash), bytes)?;
        Ok(hash)
    }

    fn get_blob(&self, hash: Hash) -> StoreResult<Vec<u8>> {
        let path = self.blob_path(&hash);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(StoreError::Missing(hash)),
            Err(err) => return Err(io_error(path, err)),
        };
        verify(hash, &bytes)?;
        Ok(bytes)
    }

    fn has_blob(&self, hash: Hash) -> StoreResult<bool> {
        Ok(self.blob_path(&hash).exists())
    }

    fn delete_blob(&self, hash: Hash) -> StoreResult<()> {
        let path = self.blob_path(&hash);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(path, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn blobs_fan_out_by_hash_prefix() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let hash = store.put_blob(b"bundle bytes").unwrap();
        let path = store.blob_path(&hash);
        let fan = &hex::encode(hash.as_bytes())[..2];
        assert!(path.starts_with(dir.path().join("blobs").join(fan)));
        assert_eq!(store.get_blob(hash).unwrap(), b"bundle bytes");
    }

    #[test]
    fn reopen_sees_previous_blobs() {
        let dir = TempDir::new().expect("tmp");
        let hash = FsStore::open(dir.path()).unwrap().put_blob(b"heap image").unwrap();
        let again = FsStore::open(dir.path()).unwrap();
        assert_eq!(again.get_blob(hash).unwrap(), b"heap image");
    }

    #[test]
    fn rewritten_file_fails_verification() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let hash = store.put_blob(b"snapshot at 13").unwrap();
        std::fs::write(store.blob_path(&hash), b"snapshot at 14").unwrap();
        assert!(matches!(
            store.get_blob(hash),
            Err(StoreError::HashMismatch { .. })
        ));
    }

    #[test]
    fn delete_removes_file() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStore::open(dir.path()).expect("open");
        let hash = store.put_blob(b"old snapshot").unwrap();
        store.delete_blob(hash).unwrap();
        assert!(!store.has_blob(hash).unwrap());
        assert!(matches!(store.get_blob(hash), Err(StoreError::Missing(_))));
    }
}
