//! Frame I/O over an established link.
//!
//! `FrameReader` turns a byte stream into a lazy sequence of frames that
//! ends cleanly at EOF on a frame boundary. `LinkWriter` is the only way to
//! write to a link; its mutex keeps frames from interleaving.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use tether_core::wire::{Frame, FrameHeader, WireError, FRAME_HEADER_LEN};

use crate::transport::BoxWriter;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("stream ended mid-frame ({got} of {expected} bytes)")]
    Truncated { expected: usize, got: usize },

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Malformed input from the peer, as opposed to a failing transport.
    pub fn is_malformed(&self) -> bool {
        matches!(self, FrameError::Wire(_) | FrameError::Truncated { .. })
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

pub struct FrameReader<R> {
    inner: R,
    max_payload: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_payload: u32) -> Self {
        Self { inner, max_payload }
    }

    /// Next frame, or `None` once the peer closed the stream between frames.
    pub async fn next(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let got = read_full(&mut self.inner, &mut header).await?;
        if got == 0 {
            return Ok(None);
        }
        if got < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated {
                expected: FRAME_HEADER_LEN,
                got,
            });
        }
        let header = FrameHeader::parse(header, self.max_payload)?;

        let len = header.length as usize;
        let mut payload = vec![0u8; len];
        let got = read_full(&mut self.inner, &mut payload).await?;
        if got < len {
            return Err(FrameError::Truncated { expected: len, got });
        }
        Ok(Some(Frame::new(header.message_type, payload)))
    }

    /// The same sequence as a `Stream`. The stream ends after the first error.
    ///
    /// Unlike `next`, polling the stream is cancel-safe: a partially read
    /// frame stays inside the stream when a `select!` branch loses.
    pub fn into_stream(self) -> impl Stream<Item = Result<Frame, FrameError>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.next().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// Fill `buf` unless EOF comes first. Returns the number of bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Serialized write access to one link. Cheap to clone.
#[derive(Clone)]
pub struct LinkWriter {
    inner: Arc<Mutex<BoxWriter>>,
    max_payload: u32,
    write_timeout: Duration,
}

impl LinkWriter {
    pub fn new(writer: BoxWriter, max_payload: u32, write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
            max_payload,
            write_timeout,
        }
    }

    /// Write one complete frame. Concurrent callers are queued, never interleaved.
    pub async fn send(&self, frame: &Frame) -> Result<(), FrameError> {
        let bytes = frame.encode(self.max_payload)?;
        let write = async {
            let mut writer = self.inner.lock().await;
            writer.write_all(&bytes).await?;
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        tokio::time::timeout(self.write_timeout, write)
            .await
            .map_err(|_| FrameError::WriteTimeout(self.write_timeout))??;
        tracing::trace!(
            message_type = frame.message_type,
            bytes = bytes.len(),
            "frame sent"
        );
        Ok(())
    }

    /// Half-close the link. Gives up if a send holds the writer too long.
    pub async fn shutdown(&self, grace: Duration) {
        let close = async {
            let mut writer = self.inner.lock().await;
            let _ = writer.shutdown().await;
        };
        let _ = tokio::time::timeout(grace, close).await;
    }
}

impl std::fmt::Debug for LinkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkWriter")
            .field("max_payload", &self.max_payload)
            .finish_non_exhaustive()
    }
}
