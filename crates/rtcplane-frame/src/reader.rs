use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buffer::RecvBuffer;
use crate::codec::FrameConfig;
use crate::error::{FrameError, Result};

/// Complete frames produced by one or more socket reads.
#[derive(Debug, Default)]
pub struct FrameBatch {
    /// Payloads in wire order.
    pub frames: Vec<Bytes>,
    /// Set when unread data overflowed and was discarded during this batch.
    pub overflow: Option<FrameError>,
}

/// Reads complete frames from any `AsyncRead` stream.
///
/// Handles partial reads internally; callers always get complete frames,
/// grouped by the socket reads that completed them.
pub struct FrameReader<T> {
    inner: T,
    recv: RecvBuffer,
    chunk: Vec<u8>,
    config: FrameConfig,
}

impl<T: AsyncRead + Unpin> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            recv: RecvBuffer::with_max_payload(config.max_payload_size),
            chunk: vec![0u8; config.read_chunk_size.max(1)],
            config,
        }
    }

    /// Read until at least one frame completes or the buffer overflows.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub async fn read_batch(&mut self) -> Result<FrameBatch> {
        loop {
            let read = match self.inner.read(&mut self.chunk).await {
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            let mut batch = FrameBatch::default();
            if let Err(err) = self.recv.push(&self.chunk[..read], &mut batch.frames) {
                batch.overflow = Some(err);
            }

            if !batch.frames.is_empty() || batch.overflow.is_some() {
                return Ok(batch);
            }
        }
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.recv.len()
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
