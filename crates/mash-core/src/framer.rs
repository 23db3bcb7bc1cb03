//! Length-prefixed frame I/O over a byte stream (spec.md §4.1).
//!
//! `write_frame` emits one frame; `read_frame` blocks until a complete frame
//! arrives or the stream errors. A deadline set via [`Framer::set_read_deadline`]
//! persists across calls and is restored by the caller -- it never fires
//! mid-frame, only between calls, which is the property the multiplexer in
//! [`crate::pool`] relies on to cover an unbounded run of interleaved
//! notifications with a single deadline.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant as TokioInstant;

/// Maximum frame body size accepted on read, guarding against a peer that
/// sends a bogus length prefix and exhausting memory.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FramerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("read deadline elapsed")]
    Timeout,
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge(u32),
}

/// Length-prefixed framing: a big-endian `u32` byte count followed by the body.
pub struct Framer<S> {
    stream: S,
    read_deadline: Option<TokioInstant>,
}

impl<S> Framer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_deadline: None,
        }
    }

    /// Sets (or clears, with `None`) the deadline governing subsequent reads.
    ///
    /// Returns the previous deadline so callers can restore it on exit, per
    /// spec.md §4.3.1 step 2 ("apply it to the stream read side; restore on
    /// exit").
    pub fn set_read_deadline(&mut self, deadline: Option<TokioInstant>) -> Option<TokioInstant> {
        std::mem::replace(&mut self.read_deadline, deadline)
    }

    /// Exposes the raw stream underneath the framing, for protocols (PASE)
    /// that exchange their own messages before any length-prefixed framing
    /// is meaningful.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FramerError> {
        let len = u32::try_from(payload.len()).map_err(|_| FramerError::FrameTooLarge(u32::MAX))?;
        if len > MAX_FRAME_BYTES {
            return Err(FramerError::FrameTooLarge(len));
        }
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads exactly one framed message. Deadlines set between calls fire
    /// only between reads, never mid-frame: the single `timeout_at` below
    /// wraps reading one whole frame, not individual syscalls within it.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, FramerError> {
        let read = Self::read_one(&mut self.stream);
        let bytes = match self.read_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, read).await {
                Ok(result) => result?,
                Err(_) => return Err(FramerError::Timeout),
            },
            None => read.await?,
        };
        Ok(bytes)
    }

    async fn read_one(stream: &mut S) -> Result<Vec<u8>, FramerError> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            return Err(FramerError::FrameTooLarge(len));
        }
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (client, server) = duplex(1024);
        let mut client = Framer::new(client);
        let mut server = Framer::new(server);

        client.write_frame(b"hello").await.unwrap();
        let got = server.read_frame().await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn read_deadline_elapses_between_calls() {
        let (_client, server) = duplex(1024);
        let mut server = Framer::new(server);
        server.set_read_deadline(Some(TokioInstant::now()));
        let err = server.read_frame().await.unwrap_err();
        assert!(matches!(err, FramerError::Timeout));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, server) = duplex(32);
        let mut server = Framer::new(server);
        client
            .write_all(&(MAX_FRAME_BYTES + 1).to_be_bytes())
            .await
            .unwrap();
        let err = server.read_frame().await.unwrap_err();
        assert!(matches!(err, FramerError::FrameTooLarge(_)));
    }
}
