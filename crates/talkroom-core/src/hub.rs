//! The shared realtime service object.
//!
//! A [`Hub`] owns the session registry, the membership index and the router,
//! plus the collaborators they depend on. One hub is shared by every
//! connection on a server.
//!
//! Transitions that touch both the registry and the index (admitting a
//! connection, indexing its rooms, retiring it) run under one presence lock,
//! and the registry decides which connection's view of a user wins.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use talkroom_protocol::{codec::MAX_FRAME_SIZE, RoomId, UserId};
use talkroom_transport::{CloseReason, ConnectionId};
use tracing::{debug, info};

use crate::connection::{ConnectionHandle, DEFAULT_QUEUE_CAPACITY};
use crate::directory::InMemoryDirectory;
use crate::membership::MembershipIndex;
use crate::router::BroadcastRouter;
use crate::session::SessionRegistry;
use crate::store::{Authenticator, MembershipStore, MessageStore, StoreError};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_frame_size: usize,
    /// Outbound queue capacity per connection.
    pub outbound_queue_capacity: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Close a connection after this long without inbound traffic.
    pub idle_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_frame_size: MAX_FRAME_SIZE,
            outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Registered sessions.
    pub connections: usize,
    /// Users in the membership index.
    pub indexed_users: usize,
    /// Rooms with at least one indexed member.
    pub active_rooms: usize,
}

/// Shared state behind every connection.
pub struct Hub {
    sessions: Arc<SessionRegistry>,
    memberships: Arc<MembershipIndex>,
    router: BroadcastRouter,
    authenticator: Arc<dyn Authenticator>,
    membership_store: Arc<dyn MembershipStore>,
    message_store: Arc<dyn MessageStore>,
    config: HubConfig,
    presence: Mutex<()>,
}

impl Hub {
    /// Create a hub over the given collaborators.
    #[must_use]
    pub fn new(
        config: HubConfig,
        authenticator: Arc<dyn Authenticator>,
        membership_store: Arc<dyn MembershipStore>,
        message_store: Arc<dyn MessageStore>,
    ) -> Self {
        info!("Creating hub with config: {:?}", config);
        let sessions = Arc::new(SessionRegistry::new());
        let memberships = Arc::new(MembershipIndex::new());
        let router = BroadcastRouter::new(Arc::clone(&sessions), Arc::clone(&memberships));

        Self {
            sessions,
            memberships,
            router,
            authenticator,
            membership_store,
            message_store,
            config,
            presence: Mutex::new(()),
        }
    }

    /// Create a hub backed entirely by one in-memory directory.
    #[must_use]
    pub fn with_directory(config: HubConfig, directory: Arc<InMemoryDirectory>) -> Self {
        Self::new(
            config,
            directory.clone(),
            directory.clone(),
            directory,
        )
    }

    /// Get the session registry.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Get the membership index.
    #[must_use]
    pub fn memberships(&self) -> &MembershipIndex {
        &self.memberships
    }

    /// Get the broadcast router.
    #[must_use]
    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    /// Get the authenticator.
    #[must_use]
    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    /// Get the membership store.
    #[must_use]
    pub fn membership_store(&self) -> &dyn MembershipStore {
        self.membership_store.as_ref()
    }

    /// Get the message store.
    #[must_use]
    pub fn message_store(&self) -> &dyn MessageStore {
        self.message_store.as_ref()
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Online members of a room, in ascending ID order.
    #[must_use]
    pub fn online_members(&self, room_id: RoomId) -> Vec<UserId> {
        let mut members: Vec<_> = self
            .memberships
            .online_members_of(room_id, &self.sessions)
            .into_iter()
            .collect();
        members.sort_unstable();
        members
    }

    /// Make `handle` the user's live connection, returning the one it
    /// replaced.
    pub fn admit(&self, user_id: UserId, handle: ConnectionHandle) -> Option<ConnectionId> {
        let _presence = self.presence.lock();
        self.sessions.register(user_id, handle)
    }

    /// Load a connection's rooms into the index.
    ///
    /// The rooms are indexed only if `connection_id` is still the user's live
    /// connection once the store answers; `Ok(None)` means a newer connection
    /// took over and nothing was written.
    ///
    /// # Errors
    ///
    /// Returns the store error after indexing the user with no rooms.
    pub async fn index_memberships(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<Option<usize>, StoreError> {
        let loaded = self.membership_store.load_memberships(user_id).await;

        let _presence = self.presence.lock();
        if self.sessions.connection_id(user_id) != Some(connection_id) {
            debug!(user_id = %user_id, connection = %connection_id, "Superseded before memberships loaded");
            return Ok(None);
        }
        self.memberships.apply_loaded(user_id, loaded).map(Some)
    }

    /// Release a connection and drop the user from the index.
    ///
    /// Returns the rooms the user was indexed in, or `None` when another
    /// connection is live for the user and the index is left to it.
    pub fn retire(&self, user_id: UserId, connection_id: ConnectionId) -> Option<HashSet<RoomId>> {
        let _presence = self.presence.lock();
        self.sessions.release(user_id, connection_id);
        if self.sessions.is_online(user_id) {
            return None;
        }
        Some(self.memberships.drop_user(user_id))
    }

    /// Check whether a new connection for `user_id` must be refused.
    ///
    /// A user replacing their own connection is always admitted.
    #[must_use]
    pub fn at_capacity(&self, user_id: UserId) -> bool {
        self.sessions.len() >= self.config.max_connections && !self.sessions.is_online(user_id)
    }

    /// Ask every connection to close.
    pub fn shutdown(&self) {
        info!(connections = self.sessions.len(), "Closing all connections");
        self.sessions
            .close_all(&CloseReason::going_away("Server shutting down"));
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.sessions.len(),
            indexed_users: self.memberships.user_count(),
            active_rooms: self.memberships.room_count(),
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("stats", &self.stats())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
