//! Types shared by the kernel and its worker processes: deliveries, results,
//! syscalls, the IPC message envelopes and their netstring framing.

pub mod delivery;
pub mod netstring;
pub mod protocol;
pub mod syscall;

pub use delivery::{
    DeliveryResult, DeliveryStatus, InitializeWorkerOptions, Metering, Resolution, VatDelivery,
    WorkerOptions,
};
pub use netstring::{NetstringDecoder, encode_netstring};
pub use protocol::{KernelToWorker, WorkerCode, WorkerToKernel};
pub use syscall::{SyscallResult, VatSyscall};

use thiserror::Error;

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed netstring: {0}")]
    Netstring(String),
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    FrameTooLarge { len: usize, limit: usize },
    #[error("malformed message: {0}")]
    Message(String),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}
