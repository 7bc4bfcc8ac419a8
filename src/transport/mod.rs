//! Transport layer
//!
//! Framed byte transports behind a single capability trait. The broker
//! core only ever sees [`Transport`]: complete frames in, complete
//! frames out. TCP carries newline-delimited frames, WebSocket carries
//! one frame per message.

mod websocket;

#[cfg(test)]
mod tests;

pub use websocket::WsTransport;

use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite;

/// Errors surfaced by a transport
#[derive(Debug)]
pub enum TransportError {
    /// Underlying socket I/O failed
    Io(io::Error),
    /// WebSocket handshake or protocol failure
    Ws(tungstenite::Error),
    /// A frame exceeded the configured size limit
    FrameTooLarge { size: usize, limit: usize },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "i/o error: {}", e),
            TransportError::Ws(e) => write!(f, "websocket error: {}", e),
            TransportError::FrameTooLarge { size, limit } => {
                write!(f, "frame of {} bytes exceeds limit of {} bytes", size, limit)
            }
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        TransportError::Ws(e)
    }
}

/// A framed, bidirectional byte transport.
///
/// One client connection sits behind exactly one `Transport`. The
/// broker never deals in partial frames: `recv` yields a complete frame
/// or `None` once the peer closed cleanly, and `send` writes a complete
/// frame or fails.
#[async_trait]
pub trait Transport: Send {
    /// Receive the next frame. `Ok(None)` means the peer closed the
    /// connection cleanly. Cancel-safe: a dropped call never loses a
    /// buffered frame.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Write one complete frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the transport, flushing whatever the protocol requires.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Newline-delimited frames over a raw byte stream.
///
/// Generic over the stream so tests can drive it with in-memory I/O.
/// Partial lines accumulate in an internal buffer until the newline
/// arrives; the buffer surviving across calls is what makes `recv`
/// cancel-safe.
pub struct TcpTransport<S> {
    stream: S,
    buf: BytesMut,
    max_frame_size: usize,
}

impl<S> TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, max_frame_size: usize) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Cut the next complete line out of the read buffer. Strips the
    /// trailing `\n` (and `\r` if present) and skips blank lines.
    fn take_line(&mut self) -> Option<Bytes> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            return Some(line.freeze());
        }
        None
    }
}

#[async_trait]
impl<S> Transport for TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            // no complete line buffered, so everything here is one
            // partial frame
            if self.buf.len() > self.max_frame_size {
                return Err(TransportError::FrameTooLarge {
                    size: self.buf.len(),
                    limit: self.max_frame_size,
                });
            }
            let read = self.stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                // EOF; a partial trailing line is dropped
                return Ok(None);
            }
        }
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let mut wire = BytesMut::with_capacity(frame.len() + 1);
        wire.extend_from_slice(&frame);
        wire.put_u8(b'\n');
        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
