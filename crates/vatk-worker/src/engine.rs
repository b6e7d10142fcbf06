use async_trait::async_trait;
use vatk_abi::{DeliveryResult, SyscallResult, VatDelivery, VatSyscall, WorkerCode};

use crate::CounterEngine;

/// Channel back to the kernel while a delivery runs.
#[async_trait]
pub trait Syscaller: Send {
    async fn syscall(&mut self, syscall: VatSyscall) -> anyhow::Result<SyscallResult>;
}

/// The code-evaluation engine hosted by a worker.
///
/// `deliver` receives only real deliveries; worker lifecycle entries are
/// turned into `evaluate`, `snapshot` and `restore` calls by the kernel. An
/// `Err` from any method is fatal to the worker. A delivery that merely fails
/// reports it in the returned [`DeliveryResult`].
#[async_trait]
pub trait Engine: Send {
    fn name(&self) -> &str;

    async fn evaluate(&mut self, code: &WorkerCode) -> anyhow::Result<()>;

    async fn deliver(
        &mut self,
        delivery: &VatDelivery,
        syscalls: &mut dyn Syscaller,
    ) -> anyhow::Result<DeliveryResult>;

    /// Serialize the heap.
    async fn snapshot(&mut self) -> anyhow::Result<Vec<u8>>;

    /// Replace the heap with one produced by `snapshot`.
    async fn restore(&mut self, heap: &[u8]) -> anyhow::Result<()>;
}

/// Engines this build knows how to host, by name.
pub fn engine_by_name(name: &str) -> Option<Box<dyn Engine>> {
    match name {
        CounterEngine::NAME => Some(Box::new(CounterEngine::new())),
        _ => None,
    }
}
