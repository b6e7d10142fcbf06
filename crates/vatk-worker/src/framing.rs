//! Netstring frames over async byte streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use vatk_abi::{KernelToWorker, NetstringDecoder, WorkerToKernel};

use crate::WorkerError;

const READ_CHUNK: usize = 64 * 1024;

pub struct FrameReader<R> {
    inner: R,
    decoder: NetstringDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: NetstringDecoder::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Next frame payload; `None` on a clean end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, WorkerError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    return Err(WorkerError::Closed);
                }
                return Ok(None);
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }

    pub async fn read_kernel_message(&mut self) -> Result<Option<KernelToWorker>, WorkerError> {
        match self.read_frame().await? {
            Some(frame) => Ok(Some(KernelToWorker::from_frame(&frame)?)),
            None => Ok(None),
        }
    }

    /// Next worker message; end of stream is a crash from the kernel's side.
    pub async fn read_worker_message(&mut self) -> Result<WorkerToKernel, WorkerError> {
        match self.read_frame().await? {
            Some(frame) => Ok(WorkerToKernel::from_frame(&frame)?),
            None => Err(WorkerError::Closed),
        }
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_raw(&mut self, frame: &[u8]) -> Result<(), WorkerError> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn send_to_worker(&mut self, msg: &KernelToWorker) -> Result<(), WorkerError> {
        self.write_raw(&msg.to_frame()?).await
    }

    pub async fn send_to_kernel(&mut self, msg: &WorkerToKernel) -> Result<(), WorkerError> {
        self.write_raw(&msg.to_frame()?).await
    }

    pub async fn shutdown(&mut self) -> Result<(), WorkerError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vatk_abi::VatDelivery;

    #[tokio::test]
    async fn frames_cross_a_small_pipe() {
        // a tiny buffer forces every frame through several partial reads
        let (a, b) = tokio::io::duplex(7);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        let sent = vec![
            KernelToWorker::Deliver(VatDelivery::BringOutYourDead),
            KernelToWorker::LoadSnapshot(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]),
            KernelToWorker::Shutdown,
        ];
        let expected = sent.clone();
        let write = tokio::spawn(async move {
            for msg in &sent {
                writer.send_to_worker(msg).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        while let Some(msg) = reader.read_kernel_message().await.unwrap() {
            got.push(msg);
        }
        write.await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn truncated_frame_is_a_closed_channel() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(b);
        a.write_all(b"10:abc").await.unwrap();
        drop(a);
        assert!(matches!(
            reader.read_worker_message().await,
            Err(WorkerError::Closed)
        ));
    }
}
