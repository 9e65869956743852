//! Framed peer transport
//!
//! The sync protocol runs over any reliable exchange of length-delimited
//! payloads. Connection lifecycle and peer discovery live outside the
//! core; [`StreamTransport`] is the reference implementation over a byte
//! stream: a u32 big-endian length prefix per frame, with a timeout on
//! every read and write. A timeout aborts only the current exchange,
//! never the process.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Largest accepted frame.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Default per-operation timeout.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("read or write timed out")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

/// A reliable, framed, timeout-carrying exchange of payloads.
pub trait FramedTransport {
    fn send(
        &mut self,
        payload: &[u8],
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
    fn recv(&mut self)
        -> impl std::future::Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

/// Length-prefixed framing over any async byte stream.
pub struct StreamTransport<S> {
    stream: S,
    timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self::with_timeout(stream, DEFAULT_IO_TIMEOUT)
    }

    pub fn with_timeout(stream: S, timeout: Duration) -> Self {
        Self { stream, timeout }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> FramedTransport for StreamTransport<S> {
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }
        let len = (payload.len() as u32).to_be_bytes();
        timeout(self.timeout, async {
            self.stream.write_all(&len).await?;
            self.stream.write_all(payload).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(map_io)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut len_buf = [0u8; 4];
        timeout(self.timeout, self.stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(map_io)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        timeout(self.timeout, self.stream.read_exact(&mut payload))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(map_io)?;
        Ok(payload)
    }
}

fn map_io(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(err)
    }
}
