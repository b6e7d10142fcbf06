//! Content-addressed blob storage and the string key-value layer that kernel
//! state persists through.

mod fs_store;
pub mod kv;
mod mem_store;

pub use fs_store::FsStore;
pub use kv::{
    BufferedKv, KeyIter, KvError, KvObserver, KvOp, KvResult, KvStore, MemKv, NoopObserver,
    ReadOnlyKv, SqliteKv,
};
pub use mem_store::MemStore;

use std::{io, path::PathBuf, sync::Arc};
use vatk_cbor::Hash;

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynStore = Arc<dyn Store>;

/// Trait implemented by all content-addressed blob stores.
///
/// Writing the same bytes twice yields the same hash and stores them once.
pub trait Store: Send + Sync {
    fn put_blob(&self, bytes: &[u8]) -> StoreResult<Hash>;
    fn get_blob(&self, hash: Hash) -> StoreResult<Vec<u8>>;
    fn has_blob(&self, hash: Hash) -> StoreResult<bool>;
    /// Removes a blob. Deleting an absent blob is not an error.
    fn delete_blob(&self, hash: Hash) -> StoreResult<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("blob {0} not found")]
    Missing(Hash),
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

/// Re-hash loaded bytes and reject them if they no longer match their address.
pub(crate) fn verify(hash: Hash, bytes: &[u8]) -> StoreResult<()> {
    let actual = Hash::of_bytes(bytes);
    if actual != hash {
        return Err(StoreError::HashMismatch {
            expected: hash,
            actual,
        });
    }
    Ok(())
}
