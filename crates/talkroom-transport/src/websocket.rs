//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to the [`FrameSource`] /
//! [`FrameSink`] pair.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use tracing::{debug, warn};

use crate::traits::{CloseReason, FrameSink, FrameSource, Incoming, TransportError};

/// Split an upgraded socket into its inbound and outbound halves.
#[must_use]
pub fn split(socket: WebSocket) -> (WebSocketSource, WebSocketSink) {
    let (sink, stream) = socket.split();
    (WebSocketSource { stream }, WebSocketSink { sink })
}

/// Inbound half of a WebSocket connection.
pub struct WebSocketSource {
    stream: SplitStream<WebSocket>,
}

/// Outbound half of a WebSocket connection.
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(Incoming::Text(text))),
            // Clients occasionally send JSON as binary frames.
            Some(Ok(Message::Binary(data))) => Ok(Some(Incoming::from_binary(data))),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                Ok(Some(Incoming::Heartbeat))
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(code = ?frame.as_ref().map(|f| f.code), "Received close frame");
                Ok(None)
            }
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket receive error");
                Err(TransportError::ReceiveFailed(e.to_string()))
            }
            None => {
                debug!("WebSocket stream ended");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let text = std::str::from_utf8(&payload)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?
            .to_owned();

        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: reason.code,
            reason: Cow::Owned(reason.reason),
        };

        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}
