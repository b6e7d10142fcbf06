//! Kernel-side handle to one worker.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use vatk_abi::{
    DeliveryResult, KernelToWorker, SyscallResult, VatDelivery, VatSyscall, WorkerCode,
    WorkerOptions, WorkerToKernel,
};

use crate::{FrameReader, FrameWriter, WorkerError, engine_by_name, serve};

const LOCAL_PIPE_CAPACITY: usize = 256 * 1024;

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

enum Hosting {
    Task(JoinHandle<()>),
    Child(Child),
    Remote,
}

/// A live worker. Every transport speaks the same framed protocol, so the
/// kernel drives all of them through this one type.
pub struct WorkerHandle {
    options: WorkerOptions,
    reader: FrameReader<BoxedReader>,
    writer: FrameWriter<BoxedWriter>,
    hosting: Hosting,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub async fn spawn(options: &WorkerOptions) -> Result<Self, WorkerError> {
        let (reader, writer, hosting): (BoxedReader, BoxedWriter, Hosting) = match options {
            WorkerOptions::Local { engine } => {
                let engine = engine_by_name(engine)
                    .ok_or_else(|| WorkerError::UnknownEngine(engine.clone()))?;
                let (kernel_side, worker_side) = tokio::io::duplex(LOCAL_PIPE_CAPACITY);
                let (worker_read, worker_write) = tokio::io::split(worker_side);
                let task = tokio::spawn(async move {
                    if let Err(err) = serve(engine, worker_read, worker_write).await {
                        tracing::warn!("local worker stopped: {err:#}");
                    }
                });
                let (read, write) = tokio::io::split(kernel_side);
                (Box::new(read), Box::new(write), Hosting::Task(task))
            }
            WorkerOptions::Subprocess { program, args } => {
                let mut child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| WorkerError::Spawn(format!("{program}: {e}")))?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| WorkerError::Spawn("child stdin unavailable".into()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| WorkerError::Spawn("child stdout unavailable".into()))?;
                tracing::debug!(pid = child.id(), %program, "spawned worker process");
                (Box::new(stdout), Box::new(stdin), Hosting::Child(child))
            }
            WorkerOptions::Remote { socket } => {
                let stream = UnixStream::connect(socket)
                    .await
                    .map_err(|e| WorkerError::Spawn(format!("connect {socket}: {e}")))?;
                let (read, write) = stream.into_split();
                (Box::new(read), Box::new(write), Hosting::Remote)
            }
        };
        Ok(Self {
            options: options.clone(),
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            hosting,
        })
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub async fn evaluate(&mut self, code: WorkerCode) -> Result<(), WorkerError> {
        self.writer
            .send_to_worker(&KernelToWorker::Evaluate(code))
            .await?;
        match self.reader.read_worker_message().await? {
            WorkerToKernel::Evaluated { error: None } => Ok(()),
            WorkerToKernel::Evaluated {
                error: Some(problem),
            } => Err(WorkerError::Rejected {
                op: "evaluate",
                problem,
            }),
            other => Err(unexpected("evaluated", &other)),
        }
    }

    /// Send one delivery and answer its syscalls until the worker reports a
    /// result. Not cancelable once sent.
    pub async fn deliver<F>(
        &mut self,
        delivery: &VatDelivery,
        mut on_syscall: F,
    ) -> Result<DeliveryResult, WorkerError>
    where
        F: FnMut(&VatSyscall) -> SyscallResult,
    {
        self.writer
            .send_to_worker(&KernelToWorker::Deliver(delivery.clone()))
            .await?;
        loop {
            match self.reader.read_worker_message().await? {
                WorkerToKernel::Syscall(syscall) => {
                    let result = on_syscall(&syscall);
                    self.writer
                        .send_to_worker(&KernelToWorker::SyscallResult(result))
                        .await?;
                }
                WorkerToKernel::DeliverDone(result) => return Ok(result),
                other => return Err(unexpected("deliverDone", &other)),
            }
        }
    }

    /// Ask the worker to serialize its heap.
    pub async fn snapshot(&mut self) -> Result<Vec<u8>, WorkerError> {
        self.writer
            .send_to_worker(&KernelToWorker::SaveSnapshot)
            .await?;
        match self.reader.read_worker_message().await? {
            WorkerToKernel::SnapshotSaved(heap) => Ok(heap),
            other => Err(unexpected("snapshotSaved", &other)),
        }
    }

    pub async fn restore(&mut self, heap: &[u8]) -> Result<(), WorkerError> {
        self.writer
            .send_to_worker(&KernelToWorker::LoadSnapshot(heap.to_vec()))
            .await?;
        match self.reader.read_worker_message().await? {
            WorkerToKernel::SnapshotLoaded { error: None } => Ok(()),
            WorkerToKernel::SnapshotLoaded {
                error: Some(problem),
            } => Err(WorkerError::Rejected {
                op: "load snapshot",
                problem,
            }),
            other => Err(unexpected("snapshotLoaded", &other)),
        }
    }

    /// Stop the worker. Always completes: a worker that does not acknowledge
    /// within `timeout` is killed.
    pub async fn shutdown(mut self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.request_shutdown()).await {
            Ok(Ok(())) => tracing::debug!("worker acknowledged shutdown"),
            Ok(Err(err)) => tracing::debug!("worker gone before shutdown: {err}"),
            Err(_) => tracing::warn!("worker did not acknowledge shutdown within {timeout:?}"),
        }
        let _ = self.writer.shutdown().await;

        match self.hosting {
            Hosting::Task(task) => {
                let abort = task.abort_handle();
                if tokio::time::timeout(timeout, task).await.is_err() {
                    tracing::warn!("local worker task still running; aborting");
                    abort.abort();
                }
            }
            Hosting::Child(mut child) => {
                if tokio::time::timeout(timeout, child.wait()).await.is_err() {
                    tracing::warn!(pid = child.id(), "killing unresponsive worker process");
                    let _ = child.kill().await;
                }
            }
            Hosting::Remote => {}
        }
    }

    async fn request_shutdown(&mut self) -> Result<(), WorkerError> {
        self.writer.send_to_worker(&KernelToWorker::Shutdown).await?;
        match self.reader.read_worker_message().await? {
            WorkerToKernel::ShutdownDone => Ok(()),
            other => Err(unexpected("shutdownDone", &other)),
        }
    }
}

fn unexpected(expected: &'static str, got: &WorkerToKernel) -> WorkerError {
    WorkerError::Unexpected {
        expected,
        got: got.tag().to_string(),
    }
}
