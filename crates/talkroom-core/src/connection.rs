//! Connection handles and the per-connection writer task.
//!
//! A [`ConnectionHandle`] is the only way the rest of the core reaches a live
//! connection. Sends go into a bounded queue and never wait on the peer; a
//! separate writer task drains the queue into the transport.

use bytes::Bytes;
use std::sync::Arc;
use talkroom_transport::{CloseReason, ConnectionId, FrameSink};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use talkroom_protocol::UserId;

/// Default outbound queue capacity per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Errors returned when pushing an event to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The user has no registered connection.
    #[error("User {0} is not connected")]
    NotConnected(UserId),

    /// The outbound queue is full.
    #[error("Outbound queue full")]
    QueueFull,

    /// The connection's writer has stopped.
    #[error("Connection closed")]
    Closed,
}

impl SendError {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            SendError::NotConnected(_) => "not_connected",
            SendError::QueueFull => "queue_full",
            SendError::Closed => "closed",
        }
    }
}

/// An item queued for the writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// An encoded event.
    Event(Bytes),
    /// A transport-level ping.
    Ping,
}

/// Cheap, cloneable handle to one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
    close: Arc<watch::Sender<Option<CloseReason>>>,
}

/// The receiving side of a connection's queue, consumed by [`run_writer`].
#[derive(Debug)]
pub struct OutboundQueue {
    outbound: mpsc::Receiver<Outbound>,
    close_rx: watch::Receiver<Option<CloseReason>>,
    close: Arc<watch::Sender<Option<CloseReason>>>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh connection ID.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, OutboundQueue) {
        Self::with_id(ConnectionId::generate(), capacity)
    }

    /// Create a handle for an existing connection ID.
    #[must_use]
    pub fn with_id(id: ConnectionId, capacity: usize) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        let close = Arc::new(close_tx);

        let handle = Self {
            id,
            outbound: tx,
            close: Arc::clone(&close),
        };
        let queue = OutboundQueue {
            outbound: rx,
            close_rx,
            close,
        };
        (handle, queue)
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an encoded event without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::QueueFull`] if the queue is at capacity and
    /// [`SendError::Closed`] if the connection is closing or its writer has
    /// stopped.
    pub fn try_send(&self, payload: Bytes) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbound
            .try_send(Outbound::Event(payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Queue a ping. Skipped when the queue is full.
    pub fn try_ping(&self) -> bool {
        self.outbound.try_send(Outbound::Ping).is_ok()
    }

    /// Ask the connection to close. Only the first reason is kept.
    pub fn close(&self, reason: CloseReason) {
        self.close.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Check whether a close was requested.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close.borrow().is_some()
    }

    /// Get the close reason, if a close was requested.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close.borrow().clone()
    }

    /// Subscribe to the close signal.
    #[must_use]
    pub fn close_signal(&self) -> watch::Receiver<Option<CloseReason>> {
        self.close.subscribe()
    }
}

impl OutboundQueue {
    /// Take the next queued item without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }
}

/// Drain a connection's queue into its sink until closed.
///
/// Sends the close frame when a close is requested. A failed write requests
/// a close so the reading side stops as well.
pub async fn run_writer<K: FrameSink>(queue: OutboundQueue, mut sink: K) {
    let OutboundQueue {
        mut outbound,
        mut close_rx,
        close,
    } = queue;

    loop {
        tokio::select! {
            biased;

            changed = close_rx.changed() => {
                let reason = close_rx.borrow().clone();
                if changed.is_ok() {
                    if let Some(reason) = reason {
                        trace!(reason = %reason, "Writer sending close");
                        let _ = sink.close(reason).await;
                    }
                }
                break;
            }

            item = outbound.recv() => {
                let result = match item {
                    Some(Outbound::Event(payload)) => sink.send(payload).await,
                    Some(Outbound::Ping) => sink.ping().await,
                    None => break,
                };

                if let Err(e) = result {
                    debug!(error = %e, "Writer failed, closing connection");
                    close.send_if_modified(|slot| {
                        if slot.is_none() {
                            *slot = Some(CloseReason::going_away("Transport failure"));
                            true
                        } else {
                            false
                        }
                    });
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talkroom_transport::memory::{self, Outgoing};

    #[test]
    fn test_queue_full() {
        let (handle, _queue) = ConnectionHandle::new(1);

        assert!(handle.try_send(Bytes::from_static(b"1")).is_ok());
        assert_eq!(
            handle.try_send(Bytes::from_static(b"2")),
            Err(SendError::QueueFull)
        );
    }

    #[test]
    fn test_close_keeps_first_reason() {
        let (handle, _queue) = ConnectionHandle::new(4);
        let signal = handle.close_signal();

        handle.close(CloseReason::replaced());
        handle.close(CloseReason::slow_consumer());

        assert!(signal.has_changed().unwrap());
        assert_eq!(handle.close_reason(), Some(CloseReason::replaced()));
        assert_eq!(
            handle.try_send(Bytes::from_static(b"x")),
            Err(SendError::Closed)
        );
    }

    #[tokio::test]
    async fn test_writer_forwards_then_closes() {
        let (_source, sink, mut peer) = memory::pair();
        let (handle, queue) = ConnectionHandle::new(8);
        let writer = tokio::spawn(run_writer(queue, sink));

        handle.try_send(Bytes::from_static(b"{}")).unwrap();
        assert!(handle.try_ping());

        assert_eq!(
            peer.recv().await,
            Some(Outgoing::Payload(Bytes::from_static(b"{}")))
        );
        assert_eq!(peer.recv().await, Some(Outgoing::Ping));

        handle.close(CloseReason::replaced());
        assert_eq!(peer.closed().await, Some(CloseReason::replaced()));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_failure_requests_close() {
        let (_source, sink, peer) = memory::pair();
        drop(peer);

        let (handle, queue) = ConnectionHandle::new(8);
        let writer = tokio::spawn(run_writer(queue, sink));

        handle.try_send(Bytes::from_static(b"{}")).unwrap();
        writer.await.unwrap();

        assert_eq!(
            handle.close_reason().map(|r| r.code),
            Some(CloseReason::GOING_AWAY)
        );
    }
}
