//! Worker side of the protocol: read kernel messages, drive the engine,
//! answer on the outbound stream.

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use vatk_abi::{KernelToWorker, SyscallResult, VatSyscall, WorkerToKernel};

use crate::{Engine, FrameReader, FrameWriter, Syscaller};

/// Serve one kernel connection until it sends `shutdown` or closes the stream.
///
/// Returns an error when the engine fails fatally or the kernel breaks the
/// protocol; the caller should then drop the streams so the kernel sees the
/// worker die.
pub async fn serve<R, W>(mut engine: Box<dyn Engine>, reader: R, writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);
    tracing::debug!(engine = engine.name(), "worker ready");

    while let Some(msg) = reader.read_kernel_message().await? {
        let reply = match msg {
            KernelToWorker::Evaluate(code) => {
                tracing::debug!(bundle = %code.bundle_id, "evaluate");
                let error = engine.evaluate(&code).await.err().map(|e| format!("{e:#}"));
                WorkerToKernel::Evaluated { error }
            }
            KernelToWorker::Deliver(delivery) => {
                tracing::trace!(kind = delivery.kind(), "deliver");
                let mut channel = ChannelSyscaller {
                    reader: &mut reader,
                    writer: &mut writer,
                };
                let result = engine
                    .deliver(&delivery, &mut channel)
                    .await
                    .with_context(|| format!("engine failed during '{}'", delivery.kind()))?;
                WorkerToKernel::DeliverDone(result)
            }
            KernelToWorker::SaveSnapshot => {
                WorkerToKernel::SnapshotSaved(engine.snapshot().await.context("save heap")?)
            }
            KernelToWorker::LoadSnapshot(heap) => {
                let error = engine.restore(&heap).await.err().map(|e| format!("{e:#}"));
                WorkerToKernel::SnapshotLoaded { error }
            }
            KernelToWorker::Shutdown => {
                writer.send_to_kernel(&WorkerToKernel::ShutdownDone).await?;
                tracing::debug!("worker shutting down");
                return Ok(());
            }
            KernelToWorker::SyscallResult(_) => {
                bail!("syscall result received with no syscall outstanding")
            }
        };
        writer.send_to_kernel(&reply).await?;
    }
    tracing::debug!("kernel closed the channel");
    Ok(())
}

struct ChannelSyscaller<'a, R, W> {
    reader: &'a mut FrameReader<R>,
    writer: &'a mut FrameWriter<W>,
}

#[async_trait]
impl<'a, R, W> Syscaller for ChannelSyscaller<'a, R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn syscall(&mut self, syscall: VatSyscall) -> anyhow::Result<SyscallResult> {
        self.writer
            .send_to_kernel(&WorkerToKernel::Syscall(syscall))
            .await?;
        match self.reader.read_kernel_message().await? {
            Some(KernelToWorker::SyscallResult(result)) => Ok(result),
            Some(other) => bail!("expected syscall result, got '{}'", other.tag()),
            None => bail!("kernel closed the channel during a syscall"),
        }
    }
}
