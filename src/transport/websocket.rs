//! WebSocket transport
//!
//! One frame per WebSocket message. The handshake validates the request
//! path; tungstenite enforces the frame size limit during the upgrade
//! and on every message after it.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;

use super::{Transport, TransportError};

/// Server-side WebSocket transport
pub struct WsTransport {
    inner: WebSocketStream<TcpStream>,
}

impl WsTransport {
    /// Accept an incoming WebSocket handshake, rejecting requests for
    /// any path other than `expected_path`.
    pub async fn accept(
        stream: TcpStream,
        expected_path: &str,
        max_frame_size: usize,
    ) -> Result<Self, TransportError> {
        let expected_path = expected_path.to_string();
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(max_frame_size);
        config.max_frame_size = Some(max_frame_size);

        let inner = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            move |req: &Request, response: Response| {
                let request_path = req.uri().path();
                if request_path != expected_path {
                    return Err(ErrorResponse::new(Some(format!(
                        "invalid path: expected '{}', got '{}'",
                        expected_path, request_path
                    ))));
                }
                Ok(response)
            },
            Some(config),
        )
        .await?;

        Ok(Self { inner })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text.into_bytes()))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                // control traffic never surfaces as a frame
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        // frames are JSON, so this only fails on a broker-side bug
        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        self.inner.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close(None).await?;
        Ok(())
    }
}
