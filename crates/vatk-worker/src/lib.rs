//! Vat workers: the engine collaborator interface, the worker-side protocol
//! loop, and the kernel-side handle that drives a worker over one of three
//! transports.

pub mod counter;
pub mod engine;
pub mod framing;
pub mod handle;
pub mod serve;

pub use counter::CounterEngine;
pub use engine::{Engine, Syscaller, engine_by_name};
pub use framing::{FrameReader, FrameWriter};
pub use handle::WorkerHandle;
pub use serve::serve;

use thiserror::Error;
use vatk_abi::AbiError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to start worker: {0}")]
    Spawn(String),
    #[error("unknown engine '{0}'")]
    UnknownEngine(String),
    #[error("worker closed its channel")]
    Closed,
    #[error("worker channel i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker protocol error: {0}")]
    Protocol(#[from] AbiError),
    #[error("unexpected message from worker: expected {expected}, got '{got}'")]
    Unexpected { expected: &'static str, got: String },
    #[error("worker failed to {op}: {problem}")]
    Rejected { op: &'static str, problem: String },
}

impl WorkerError {
    /// Whether the worker can no longer be used. Only a rejected request
    /// leaves the channel in a consistent state.
    pub fn is_crash(&self) -> bool {
        !matches!(
            self,
            WorkerError::Rejected { .. } | WorkerError::UnknownEngine(_) | WorkerError::Spawn(_)
        )
    }
}
