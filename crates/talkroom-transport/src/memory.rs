//! In-process transport.
//!
//! [`pair`] returns the two halves a dispatcher consumes plus a
//! [`MemoryPeer`] that plays the client side. Used by tests and benchmarks.

use async_trait::async_trait;
use bytes::Bytes;
use talkroom_protocol::ServerEvent;
use tokio::sync::mpsc;

use crate::traits::{CloseReason, FrameSink, FrameSource, Incoming, TransportError};

/// Something the server wrote to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// An encoded event.
    Payload(Bytes),
    /// A transport-level ping.
    Ping,
    /// A close signal.
    Close(CloseReason),
}

/// Create a connected source/sink pair and its client-side peer.
#[must_use]
pub fn pair() -> (MemorySource, MemorySink, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    (
        MemorySource { inbound: inbound_rx },
        MemorySink {
            outbound: outbound_tx,
        },
        MemoryPeer {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
        },
    )
}

/// Inbound half fed by a [`MemoryPeer`].
pub struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Incoming>,
}

/// Outbound half drained by a [`MemoryPeer`].
pub struct MemorySink {
    outbound: mpsc::UnboundedSender<Outgoing>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        Ok(self.inbound.recv().await)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.outbound
            .send(Outgoing::Payload(payload))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.outbound
            .send(Outgoing::Ping)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError> {
        self.outbound
            .send(Outgoing::Close(reason))
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// The client side of an in-memory connection.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Incoming>>,
    outbound: mpsc::UnboundedReceiver<Outgoing>,
}

impl MemoryPeer {
    /// Send a text frame. Returns `false` once disconnected.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Incoming::Text(text.into())).is_ok())
    }

    /// Send a binary frame.
    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Incoming::from_binary(data.into())).is_ok())
    }

    /// Send a JSON value as a text frame.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Send keepalive traffic.
    pub fn heartbeat(&self) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Incoming::Heartbeat).is_ok())
    }

    /// Close the client side; the server sees end of stream.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Wait for the next item written by the server.
    pub async fn recv(&mut self) -> Option<Outgoing> {
        self.outbound.recv().await
    }

    /// Take the next item written by the server without waiting.
    pub fn try_recv(&mut self) -> Option<Outgoing> {
        self.outbound.try_recv().ok()
    }

    /// Wait for the next decodable event, skipping pings.
    ///
    /// Returns `None` when the server closed or dropped the connection.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        loop {
            match self.outbound.recv().await? {
                Outgoing::Payload(bytes) => {
                    if let Ok(event) = serde_json::from_slice(&bytes) {
                        return Some(event);
                    }
                }
                Outgoing::Ping => continue,
                Outgoing::Close(_) => return None,
            }
        }
    }

    /// Drain everything already written, keeping decodable events.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            if let Outgoing::Payload(bytes) = item {
                if let Ok(event) = serde_json::from_slice(&bytes) {
                    events.push(event);
                }
            }
        }
        events
    }

    /// Wait until the server sends a close signal, skipping everything else.
    pub async fn closed(&mut self) -> Option<CloseReason> {
        loop {
            if let Outgoing::Close(reason) = self.outbound.recv().await? {
                return Some(reason);
            }
        }
    }
}
