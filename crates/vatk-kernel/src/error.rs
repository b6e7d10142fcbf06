use thiserror::Error;
use vatk_store::{KvError, StoreError};
use vatk_worker::WorkerError;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("storage API violation: {0}")]
    StorageApiViolation(String),
    #[error("bundle id mismatch: alleged {alleged}, computed {computed}")]
    BundleIdMismatch { alleged: String, computed: String },
    #[error("malformed bundle: {0}")]
    MalformedBundle(String),
    #[error("bundle '{0}' is not installed")]
    BundleNotFound(String),
    #[error("worker for vat '{vat_id}' crashed: {reason}")]
    WorkerCrashed { vat_id: String, reason: String },
    #[error("worker for vat '{vat_id}' refused a request: {source}")]
    Worker {
        vat_id: String,
        #[source]
        source: WorkerError,
    },
    #[error("replay of vat '{vat_id}' diverged at position {pos}: {detail}")]
    ReplayMismatch {
        vat_id: String,
        pos: u64,
        detail: String,
    },
    #[error("vat '{0}' has no open transcript span")]
    SpanNotOpen(String),
    #[error("vat '{0}' not found")]
    VatNotFound(String),
    #[error("vat '{0}' already exists")]
    VatExists(String),
    #[error("'{0}' cannot be delivered directly")]
    InvalidDelivery(String),
    #[error("snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("kv error: {0}")]
    Kv(KvError),
    #[error("transcript error: {0}")]
    Transcript(String),
    #[error("export error: {0}")]
    Export(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cbor error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<KvError> for KernelError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::ApiViolation { .. } => KernelError::StorageApiViolation(err.to_string()),
            other => KernelError::Kv(other),
        }
    }
}

impl KernelError {
    /// Whether the error means the kernel's own state can no longer be
    /// trusted, as opposed to a single vat failing.
    pub fn is_kernel_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::StorageApiViolation(_)
                | KernelError::Kv(_)
                | KernelError::Store(_)
                | KernelError::SpanNotOpen(_)
        )
    }
}
