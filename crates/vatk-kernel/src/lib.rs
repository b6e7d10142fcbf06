//! Vat kernel core: durable per-vat state and the warehouse that keeps vat
//! workers online by replaying their transcripts.
//!
//! All kernel state lives in a [`KernelStorage`]: a string key-value store
//! whose writes are buffered until the crank commits, plus a
//! content-addressed blob store for bundles and heap snapshots.

pub mod bundle;
pub mod config;
pub mod error;
pub mod export;
pub mod report;
pub mod snapshot;
pub mod storage;
pub mod syscall;
pub mod transcript;
pub mod warehouse;

pub use bundle::{Bundle, BundleHandler, BundleStore};
pub use config::{StorageOptions, WarehousePolicy};
pub use error::{KernelError, KernelResult};
pub use export::{KernelExport, export_storage, import_storage};
pub use report::{ErrorSink, LogSink, install_error_sink};
pub use snapshot::{SnapStore, SnapshotBlob, SnapshotInfo, SnapshotRecord};
pub use storage::{CrankHashes, KernelStorage, KeyType, key_type};
pub use syscall::{ExitRequest, KvSyscallHandler, QueuedSend, SyscallHandler, SyscallSimulator};
pub use transcript::{
    RecordedSyscall, SpanBounds, SpanReader, SpanRecord, TranscriptEntry, TranscriptStore,
};
pub use warehouse::{VatOptions, VatWarehouse};
