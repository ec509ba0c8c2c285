//! Session registry.
//!
//! Tracks the single live connection each user holds. A new connection for a
//! user who is already online replaces the old one; the replaced connection
//! is told to close with code 4000.

use bytes::Bytes;
use dashmap::DashMap;
use talkroom_protocol::UserId;
use talkroom_transport::{CloseReason, ConnectionId};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, SendError};
use crate::metrics;

/// A registered connection.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    user_id: UserId,
    handle: ConnectionHandle,
    online: bool,
    connected_at: Instant,
}

impl SessionEntry {
    fn new(user_id: UserId, handle: ConnectionHandle) -> Self {
        Self {
            user_id,
            handle,
            online: true,
            connected_at: Instant::now(),
        }
    }

    /// Get the user ID.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Get the connection handle.
    #[must_use]
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Check whether the session is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Get when the session was registered.
    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }
}

/// Registry of live sessions, at most one per user.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<UserId, SessionEntry>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user.
    ///
    /// Returns the ID of the connection this one replaced, if any. The
    /// replaced connection is asked to close.
    pub fn register(&self, user_id: UserId, handle: ConnectionHandle) -> Option<ConnectionId> {
        let connection_id = handle.id();
        let previous = self
            .sessions
            .insert(user_id, SessionEntry::new(user_id, handle))?;

        let previous_id = previous.handle.id();
        if previous_id != connection_id {
            info!(
                user_id = %user_id,
                replaced = %previous_id,
                connection = %connection_id,
                "Session replaced"
            );
            previous.handle.close(CloseReason::replaced());
            metrics::record_eviction("replaced");
        }

        Some(previous_id)
    }

    /// Remove a user's entry unconditionally.
    ///
    /// Returns `true` if an entry was removed. Idempotent.
    pub fn unregister(&self, user_id: UserId) -> bool {
        match self.sessions.remove(&user_id) {
            Some((_, mut entry)) => {
                entry.online = false;
                debug!(user_id = %user_id, connection = %entry.handle.id(), "Session unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove a user's entry only if it still belongs to `connection_id`.
    ///
    /// A replaced connection calling this leaves its successor untouched.
    pub fn release(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let released = self
            .sessions
            .remove_if(&user_id, |_, entry| entry.handle.id() == connection_id)
            .is_some();

        if released {
            debug!(user_id = %user_id, connection = %connection_id, "Session released");
        }
        released
    }

    /// Push an encoded event to a user's connection without waiting.
    ///
    /// A connection whose queue is full or closed is evicted and told to
    /// close.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] if the user has no entry, or the
    /// queue error that caused the eviction.
    pub fn send(&self, user_id: UserId, payload: Bytes) -> Result<(), SendError> {
        // Clone out so the shard lock is released before any eviction.
        let handle = self
            .sessions
            .get(&user_id)
            .map(|entry| entry.handle.clone())
            .ok_or(SendError::NotConnected(user_id))?;

        handle.try_send(payload).map_err(|e| {
            self.evict(user_id, &handle, &e);
            e
        })
    }

    fn evict(&self, user_id: UserId, handle: &ConnectionHandle, error: &SendError) {
        let released = self.release(user_id, handle.id());
        if matches!(error, SendError::QueueFull) {
            warn!(
                user_id = %user_id,
                connection = %handle.id(),
                "Outbound queue overflow, disconnecting"
            );
            handle.close(CloseReason::slow_consumer());
            metrics::record_eviction("slow_consumer");
        } else if released {
            debug!(user_id = %user_id, connection = %handle.id(), "Evicted closed connection");
            metrics::record_eviction("closed");
        }
    }

    /// Check if a user has a live connection.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.sessions
            .get(&user_id)
            .is_some_and(|entry| entry.online)
    }

    /// Get the ID of a user's current connection.
    #[must_use]
    pub fn connection_id(&self, user_id: UserId) -> Option<ConnectionId> {
        self.sessions.get(&user_id).map(|entry| entry.handle.id())
    }

    /// Get a user's current connection handle.
    #[must_use]
    pub fn handle(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.sessions.get(&user_id).map(|entry| entry.handle.clone())
    }

    /// Get all online users.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.sessions
            .iter()
            .filter(|entry| entry.online)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Snapshot every registered handle.
    #[must_use]
    pub fn handles(&self) -> Vec<(UserId, ConnectionHandle)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.handle.clone()))
            .collect()
    }

    /// Ask every connection to close.
    pub fn close_all(&self, reason: &CloseReason) {
        for (_, handle) in self.handles() {
            handle.close(reason.clone());
        }
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
