//! Transport abstraction traits for talkroom.
//!
//! A connection is split into a [`FrameSource`] read by the dispatcher loop
//! and a [`FrameSink`] owned by the connection's writer task, so a slow peer
//! never blocks inbound processing.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Counter backing [`ConnectionId::generate`].
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{:x}", self.0)
    }
}

/// Close signal sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseReason {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server going away or idle peer.
    pub const GOING_AWAY: u16 = 1001;
    /// Authentication failed.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Connection limit reached.
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// A newer connection of the same user took over.
    pub const SESSION_REPLACED: u16 = 4000;
    /// Outbound queue overflowed.
    pub const SLOW_CONSUMER: u16 = 4001;

    /// Create a close reason.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Authentication failure at channel open.
    #[must_use]
    pub fn policy_violation(reason: impl Into<String>) -> Self {
        Self::new(Self::POLICY_VIOLATION, reason)
    }

    /// Replaced by a newer session.
    #[must_use]
    pub fn replaced() -> Self {
        Self::new(Self::SESSION_REPLACED, "Session replaced by a newer connection")
    }

    /// Evicted because the outbound queue overflowed.
    #[must_use]
    pub fn slow_consumer() -> Self {
        Self::new(Self::SLOW_CONSUMER, "Outbound queue overflow")
    }

    /// Idle peer or server shutdown.
    #[must_use]
    pub fn going_away(reason: impl Into<String>) -> Self {
        Self::new(Self::GOING_AWAY, reason)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.reason)
    }
}

/// Something read from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// An application frame.
    Text(String),
    /// Transport-level keepalive traffic (ping or pong).
    Heartbeat,
    /// A frame that cannot be an application frame, with the reason.
    Malformed(&'static str),
}

impl Incoming {
    /// Interpret a binary frame, which must hold UTF-8 text.
    #[must_use]
    pub fn from_binary(data: Vec<u8>) -> Self {
        match String::from_utf8(data) {
            Ok(text) => Incoming::Text(text),
            Err(_) => Incoming::Malformed("invalid_utf8"),
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The inbound half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next item from the connection.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError>;
}

/// The outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send an encoded event.
    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError>;

    /// Send a transport-level ping.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Send a close signal. The sink must not be used afterwards.
    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError>;
}
