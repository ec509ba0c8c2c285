//! Per-connection event dispatcher.
//!
//! Drives one connection from handshake to cleanup:
//!
//! ```text
//! Connecting ──auth ok──▶ Authenticated ──register+load──▶ Active ──▶ Closed
//!      │                        │
//!      └──auth failed (1008)────┴──at capacity (1013)──────────────▶ Closed
//! ```
//!
//! While active it reads frames one at a time, so a connection's own frames
//! are handled in arrival order. Outbound traffic goes through the
//! connection's queue and a separate writer task.

use std::sync::Arc;
use std::time::Duration;
use talkroom_protocol::{
    codec, ClientFrame, MessageId, ProtocolError, RoomId, ServerEvent, UserId, UserProfile,
};
use talkroom_transport::{CloseReason, ConnectionId, FrameSink, FrameSource, Incoming};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::connection::{run_writer, ConnectionHandle};
use crate::hub::Hub;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::router::DeliveryReport;
use crate::store::{AuthError, NewMessage};

/// How long cleanup waits for the writer to flush its close frame.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake received, credential not yet checked.
    Connecting,
    /// Credential accepted, not yet registered.
    Authenticated,
    /// Registered and handling frames.
    Active,
    /// Terminal.
    Closed,
}

/// Why an active connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The client closed the connection.
    ClientClosed,
    /// The transport failed while reading.
    TransportError(String),
    /// No inbound traffic within the idle timeout.
    IdleTimeout,
    /// The core asked the connection to close.
    Signalled(CloseReason),
}

impl CloseCause {
    fn close_reason(&self) -> CloseReason {
        match self {
            CloseCause::ClientClosed => CloseReason::new(CloseReason::NORMAL, "Client disconnected"),
            CloseCause::TransportError(_) => CloseReason::going_away("Transport failure"),
            CloseCause::IdleTimeout => CloseReason::going_away("Idle timeout"),
            CloseCause::Signalled(reason) => reason.clone(),
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The credential was rejected.
    Rejected(AuthError),
    /// The server was at capacity.
    Refused(UserId),
    /// The connection was active and has been cleaned up.
    Closed {
        user_id: UserId,
        connection_id: ConnectionId,
        cause: CloseCause,
    },
}

struct ActiveSession {
    profile: UserProfile,
    handle: ConnectionHandle,
}

impl ActiveSession {
    fn user_id(&self) -> UserId {
        self.profile.id
    }

    fn connection_id(&self) -> ConnectionId {
        self.handle.id()
    }
}

/// Handles one connection's lifecycle and inbound frames.
pub struct Dispatcher {
    hub: Arc<Hub>,
    connection_id: ConnectionId,
    state: ConnectionState,
}

impl Dispatcher {
    /// Create a dispatcher for a new connection.
    #[must_use]
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            connection_id: ConnectionId::generate(),
            state: ConnectionState::Connecting,
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the connection to completion.
    pub async fn run<S, K>(mut self, credential: &str, mut source: S, mut sink: K) -> SessionOutcome
    where
        S: FrameSource,
        K: FrameSink + 'static,
    {
        let profile = match self.hub.authenticator().authenticate(credential).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(connection = %self.connection_id, reason = e.reason(), "Authentication failed");
                metrics::record_auth_failure(e.reason());
                let _ = sink
                    .close(CloseReason::policy_violation("Authentication failed"))
                    .await;
                self.transition(ConnectionState::Closed);
                return SessionOutcome::Rejected(e);
            }
        };
        self.transition(ConnectionState::Authenticated);

        if self.hub.at_capacity(profile.id) {
            warn!(
                user_id = %profile.id,
                max = self.hub.config().max_connections,
                "Connection limit reached"
            );
            metrics::record_refused();
            let _ = sink
                .close(CloseReason::new(
                    CloseReason::TRY_AGAIN_LATER,
                    "Server at capacity",
                ))
                .await;
            self.transition(ConnectionState::Closed);
            return SessionOutcome::Refused(profile.id);
        }

        let _metrics_guard = ConnectionMetricsGuard::new();
        let (handle, queue) =
            ConnectionHandle::with_id(self.connection_id, self.hub.config().outbound_queue_capacity);
        // Subscribe before registering so a replacement is never missed.
        let close_signal = handle.close_signal();
        let mut writer = tokio::spawn(run_writer(queue, sink));

        let session = ActiveSession { profile, handle };
        self.activate(&session).await;

        let cause = self.event_loop(&session, &mut source, close_signal).await;
        self.teardown(&session, &cause);

        let user_id = session.user_id();
        drop(session);
        if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            debug!(connection = %self.connection_id, "Writer did not finish in time, aborting");
            writer.abort();
        }

        SessionOutcome::Closed {
            user_id,
            connection_id: self.connection_id,
            cause,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(connection = %self.connection_id, from = ?self.state, to = ?next, "State change");
        self.state = next;
    }

    async fn activate(&mut self, session: &ActiveSession) {
        let user_id = session.user_id();

        self.hub.admit(user_id, session.handle.clone());
        let indexed = match self
            .hub
            .index_memberships(user_id, session.connection_id())
            .await
        {
            Ok(indexed) => indexed.is_some(),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Continuing without memberships");
                true
            }
        };
        self.transition(ConnectionState::Active);
        if !indexed {
            // Replaced while loading; the close signal ends this connection.
            return;
        }

        let rooms = self.hub.memberships().rooms_of(user_id);
        info!(
            user_id = %user_id,
            username = %session.profile.username,
            connection = %session.connection_id(),
            rooms = rooms.len(),
            "User connected"
        );

        self.hub.router().broadcast_to_rooms(
            rooms,
            &ServerEvent::user_status(user_id, true),
            Some(user_id),
        );
    }

    async fn event_loop<S: FrameSource>(
        &self,
        session: &ActiveSession,
        source: &mut S,
        mut close_signal: watch::Receiver<Option<CloseReason>>,
    ) -> CloseCause {
        let interval = self.hub.config().heartbeat_interval;
        let idle_timeout = self.hub.config().idle_timeout;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = close_signal.changed() => {
                    let reason = close_signal
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| CloseReason::going_away("Connection closed"));
                    return CloseCause::Signalled(reason);
                }

                incoming = source.recv() => match incoming {
                    Ok(Some(Incoming::Text(text))) => {
                        last_seen = Instant::now();
                        self.handle_text(session, &text).await;
                    }
                    Ok(Some(Incoming::Heartbeat)) => {
                        last_seen = Instant::now();
                    }
                    Ok(Some(Incoming::Malformed(reason))) => {
                        last_seen = Instant::now();
                        warn!(user_id = %session.user_id(), reason, "Malformed frame");
                        metrics::record_dropped(reason);
                    }
                    Ok(None) => return CloseCause::ClientClosed,
                    Err(e) => {
                        warn!(user_id = %session.user_id(), error = %e, "Receive failed");
                        return CloseCause::TransportError(e.to_string());
                    }
                },

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= idle_timeout {
                        info!(user_id = %session.user_id(), "Connection idle, closing");
                        return CloseCause::IdleTimeout;
                    }
                    session.handle.try_ping();
                }
            }
        }
    }

    async fn handle_text(&self, session: &ActiveSession, text: &str) {
        let started = Instant::now();

        let frame = match codec::decode_with_limit(text, self.hub.config().max_frame_size) {
            Ok(frame) => frame,
            Err(ProtocolError::UnknownType(kind)) => {
                warn!(user_id = %session.user_id(), kind = %kind, "Unknown frame type");
                metrics::record_dropped("unknown_type");
                return;
            }
            Err(e) => {
                warn!(user_id = %session.user_id(), error = %e, "Malformed frame");
                metrics::record_dropped(e.reason());
                return;
            }
        };

        let kind = frame.kind();
        let report = self.dispatch(session, frame).await;
        if let Some(report) = report {
            trace!(
                user_id = %session.user_id(),
                kind,
                delivered = report.delivered(),
                failed = report.failed(),
                "Frame handled"
            );
        }
        metrics::record_frame(kind, started.elapsed().as_secs_f64());
    }

    /// Handle one decoded frame, returning the delivery report of any
    /// broadcast it caused.
    async fn dispatch(&self, session: &ActiveSession, frame: ClientFrame) -> Option<DeliveryReport> {
        match frame {
            ClientFrame::Message {
                room_id,
                content,
                reply_to_id,
            } => self.on_message(session, room_id, content, reply_to_id).await,
            ClientFrame::Typing { room_id, is_typing } => {
                if !self.authorize(session.user_id(), room_id, "typing").await {
                    return None;
                }
                let event = ServerEvent::typing(session.user_id(), room_id, is_typing);
                Some(self.hub.router().broadcast_to_room(room_id, &event, Some(session.user_id())))
            }
            ClientFrame::JoinTalkroom { room_id } => {
                if !self.authorize(session.user_id(), room_id, "join_talkroom").await {
                    return None;
                }
                let event = ServerEvent::user_joined(&session.profile, room_id);
                Some(self.hub.router().broadcast_to_room(room_id, &event, Some(session.user_id())))
            }
            ClientFrame::LeaveTalkroom { room_id } => {
                // Leaving is announced without a membership check.
                let event = ServerEvent::user_left(&session.profile, room_id);
                Some(self.hub.router().broadcast_to_room(room_id, &event, Some(session.user_id())))
            }
            ClientFrame::Ping {} => {
                if let Err(e) = self.hub.router().unicast(session.user_id(), &ServerEvent::pong_now()) {
                    debug!(user_id = %session.user_id(), error = %e, "Failed to queue pong");
                }
                None
            }
        }
    }

    async fn on_message(
        &self,
        session: &ActiveSession,
        room_id: RoomId,
        content: String,
        reply_to_id: Option<MessageId>,
    ) -> Option<DeliveryReport> {
        let user_id = session.user_id();

        if content.is_empty() {
            debug!(user_id = %user_id, room_id = %room_id, "Dropping empty message");
            metrics::record_dropped("empty_content");
            return None;
        }
        if !self.authorize(user_id, room_id, "message").await {
            return None;
        }

        let message = NewMessage::text(room_id, user_id, content, reply_to_id);
        match self.hub.message_store().append_message(message).await {
            Ok(record) => {
                debug!(user_id = %user_id, room_id = %room_id, message_id = record.id, "Message stored");
                Some(
                    self.hub
                        .router()
                        .broadcast_to_room(room_id, &ServerEvent::Message(record), None),
                )
            }
            Err(e) => {
                error!(user_id = %user_id, room_id = %room_id, error = %e, "Failed to store message");
                metrics::record_persistence_failure();
                let event = ServerEvent::error(e.code(), "Failed to send message", Some(room_id));
                if let Err(e) = self.hub.router().unicast(user_id, &event) {
                    debug!(user_id = %user_id, error = %e, "Failed to queue error");
                }
                None
            }
        }
    }

    /// Check membership against the store and correct the index if it
    /// disagrees.
    async fn authorize(&self, user_id: UserId, room_id: RoomId, kind: &'static str) -> bool {
        let is_member = match self
            .hub
            .membership_store()
            .verify_membership(user_id, room_id)
            .await
        {
            Ok(is_member) => is_member,
            Err(e) => {
                warn!(user_id = %user_id, room_id = %room_id, error = %e, "Membership check failed");
                false
            }
        };

        if self.hub.memberships().contains(user_id, room_id) != is_member {
            self.hub.memberships().reconcile(user_id, room_id, is_member);
        }

        if !is_member {
            warn!(user_id = %user_id, room_id = %room_id, kind, "Not a member, dropping frame");
            metrics::record_dropped("not_member");
        }
        is_member
    }

    fn teardown(&mut self, session: &ActiveSession, cause: &CloseCause) {
        let user_id = session.user_id();
        let connection_id = session.connection_id();
        self.transition(ConnectionState::Closed);

        // None: a newer connection for this user owns the presence state.
        let retired = self.hub.retire(user_id, connection_id);
        let superseded = retired.is_none();
        if let Some(rooms) = retired {
            self.hub.router().broadcast_to_rooms(
                rooms,
                &ServerEvent::user_status(user_id, false),
                Some(user_id),
            );
        }

        session.handle.close(cause.close_reason());
        info!(
            user_id = %user_id,
            connection = %connection_id,
            cause = ?cause,
            superseded,
            "User disconnected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::hub::HubConfig;
    use crate::store::{MembershipStore, MessageStore, StoreError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use talkroom_protocol::MessageRecord;
    use talkroom_transport::memory::{self, MemoryPeer, Outgoing};
    use talkroom_transport::TransportError;
    use tokio::sync::Semaphore;
    use tokio::task::JoinHandle;

    const ROOM: RoomId = RoomId(7);

    struct Harness {
        hub: Arc<Hub>,
        dir: Arc<InMemoryDirectory>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(HubConfig::default())
        }

        fn with_config(config: HubConfig) -> Self {
            let dir = Self::seeded();
            let hub = Arc::new(Hub::with_directory(config, Arc::clone(&dir)));
            Self { hub, dir }
        }

        /// Authenticate against `dir` but read memberships and store
        /// messages through the given collaborators.
        fn with_stores(
            dir: Arc<InMemoryDirectory>,
            members: Arc<dyn MembershipStore>,
            messages: Arc<dyn MessageStore>,
        ) -> Self {
            let hub = Arc::new(Hub::new(HubConfig::default(), dir.clone(), members, messages));
            Self { hub, dir }
        }

        /// alice (1) and bob (2) share room 7; carol (3) is in no rooms.
        fn seeded() -> Arc<InMemoryDirectory> {
            let dir = Arc::new(InMemoryDirectory::new());
            for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
                dir.add_user(UserProfile::new(UserId(id), name));
                dir.issue_credential(format!("tok-{name}"), UserId(id), None);
            }
            dir.add_member(ROOM, UserId(1));
            dir.add_member(ROOM, UserId(2));
            dir
        }

        fn spawn(&self, credential: &str) -> (MemoryPeer, JoinHandle<SessionOutcome>) {
            let (source, sink, peer) = memory::pair();
            let hub = Arc::clone(&self.hub);
            let credential = credential.to_string();
            let task =
                tokio::spawn(async move { Dispatcher::new(hub).run(&credential, source, sink).await });
            (peer, task)
        }

        async fn connect(
            &self,
            credential: &str,
            user_id: UserId,
        ) -> (MemoryPeer, JoinHandle<SessionOutcome>) {
            let (peer, task) = self.spawn(credential);
            let hub = Arc::clone(&self.hub);
            eventually(|| hub.sessions().is_online(user_id) && hub.memberships().is_indexed(user_id))
                .await;
            (peer, task)
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    /// Round-trip a ping, returning every event received before the pong.
    async fn sync(peer: &mut MemoryPeer) -> Vec<ServerEvent> {
        assert!(peer.send_json(&json!({"type": "ping"})));
        let mut seen = Vec::new();
        loop {
            match peer.next_event().await {
                Some(ServerEvent::Pong(_)) => return seen,
                Some(event) => seen.push(event),
                None => panic!("connection closed while waiting for pong"),
            }
        }
    }

    fn profile(id: i64, name: &str) -> UserProfile {
        UserProfile::new(UserId(id), name)
    }

    /// Holds the first call that reaches it until opened.
    struct Gate {
        armed: AtomicBool,
        reached: AtomicBool,
        permits: Semaphore,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                armed: AtomicBool::new(true),
                reached: AtomicBool::new(false),
                permits: Semaphore::new(0),
            })
        }

        async fn pass(&self) {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.reached.store(true, Ordering::SeqCst);
                let _permit = self.permits.acquire().await;
            }
        }

        fn reached(&self) -> bool {
            self.reached.load(Ordering::SeqCst)
        }

        fn open(&self) {
            self.permits.add_permits(1);
        }
    }

    struct GatedMemberships {
        dir: Arc<InMemoryDirectory>,
        gate: Arc<Gate>,
    }

    #[async_trait]
    impl MembershipStore for GatedMemberships {
        async fn load_memberships(&self, user_id: UserId) -> Result<HashSet<RoomId>, StoreError> {
            self.gate.pass().await;
            self.dir.load_memberships(user_id).await
        }

        async fn verify_membership(
            &self,
            user_id: UserId,
            room_id: RoomId,
        ) -> Result<bool, StoreError> {
            self.dir.verify_membership(user_id, room_id).await
        }
    }

    struct GatedMessages {
        dir: Arc<InMemoryDirectory>,
        gate: Arc<Gate>,
    }

    #[async_trait]
    impl MessageStore for GatedMessages {
        async fn append_message(&self, message: NewMessage) -> Result<MessageRecord, StoreError> {
            self.gate.pass().await;
            self.dir.append_message(message).await
        }
    }

    /// A sink whose writes never complete.
    struct StalledSink {
        dropped: Arc<AtomicBool>,
    }

    impl Drop for StalledSink {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send(&mut self, _payload: Bytes) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn ping(&mut self) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn close(&mut self, _reason: CloseReason) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_new_dispatcher_is_connecting() {
        let h = Harness::new();
        assert_eq!(Dispatcher::new(h.hub).state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_message_fans_out_to_room() {
        let h = Harness::new();
        let (mut a, _ta) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;

        assert_eq!(
            a.next_event().await,
            Some(ServerEvent::user_status(UserId(2), true))
        );

        a.send_json(&json!({"type": "message", "talkroom_id": 7, "content": "hi"}));

        let Some(ServerEvent::Message(on_b)) = b.next_event().await else {
            panic!("expected message on bob");
        };
        let Some(ServerEvent::Message(on_a)) = a.next_event().await else {
            panic!("expected message echoed to alice");
        };

        assert_eq!(on_a, on_b);
        assert_eq!(on_b.content, "hi");
        assert_eq!(on_b.room_id, ROOM);
        assert_eq!(on_b.sender_id, UserId(1));
        assert_eq!(
            h.dir.appended(),
            vec![NewMessage::text(ROOM, UserId(1), "hi", None)]
        );
    }

    #[tokio::test]
    async fn test_messages_arrive_in_send_order() {
        let h = Harness::new();
        let (a, _ta) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;

        for content in ["one", "two", "three"] {
            a.send_json(&json!({"type": "message", "room_id": 7, "content": content}));
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            if let Some(ServerEvent::Message(record)) = b.next_event().await {
                received.push(record.content);
            }
        }
        assert_eq!(received, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_offline_once() {
        let h = Harness::new();
        let (mut a, ta) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;

        a.disconnect();
        let outcome = ta.await.unwrap();
        assert!(matches!(
            outcome,
            SessionOutcome::Closed {
                user_id: UserId(1),
                cause: CloseCause::ClientClosed,
                ..
            }
        ));

        assert_eq!(
            b.next_event().await,
            Some(ServerEvent::user_status(UserId(1), false))
        );
        assert!(sync(&mut b).await.is_empty());

        assert!(!h.hub.sessions().is_online(UserId(1)));
        assert!(!h.hub.memberships().is_indexed(UserId(1)));
        assert_eq!(h.hub.online_members(ROOM), vec![UserId(2)]);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_frames_are_ignored() {
        let h = Harness::new();
        let (mut a, _ta) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;
        assert_eq!(sync(&mut a).await.len(), 1);

        a.send_json(&json!({"type": "bogus", "room_id": 7}));
        a.send_text("not json");
        a.send_json(&json!({"type": "typing", "room_id": 7}));

        assert!(sync(&mut a).await.is_empty());
        assert!(sync(&mut b).await.is_empty());
        assert!(h.hub.sessions().is_online(UserId(1)));
    }

    #[tokio::test]
    async fn test_non_member_message_is_dropped() {
        let h = Harness::new();
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;
        let (mut c, _tc) = h.connect("tok-carol", UserId(3)).await;

        c.send_json(&json!({"type": "message", "room_id": 7, "content": "let me in"}));

        assert!(sync(&mut c).await.is_empty());
        assert!(sync(&mut b).await.is_empty());
        assert_eq!(h.dir.append_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_message_is_dropped() {
        let h = Harness::new();
        let (a, _ta) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;

        a.send_json(&json!({"type": "message", "room_id": 7, "content": ""}));

        assert!(sync(&mut b).await.is_empty());
        assert_eq!(h.dir.append_count(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_closes_with_policy_violation() {
        let h = Harness::new();
        let (mut peer, task) = h.spawn("forged");

        assert_eq!(
            peer.closed().await.map(|r| r.code),
            Some(CloseReason::POLICY_VIOLATION)
        );
        assert_eq!(
            task.await.unwrap(),
            SessionOutcome::Rejected(AuthError::Invalid)
        );
        assert!(h.hub.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_connection() {
        let h = Harness::new();
        let (mut a1, ta1) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;
        let first = h.hub.sessions().connection_id(UserId(1));

        let (mut a2, _ta2) = h.spawn("tok-alice");
        let hub = Arc::clone(&h.hub);
        eventually(|| hub.sessions().connection_id(UserId(1)) != first).await;

        assert_eq!(a1.closed().await, Some(CloseReason::replaced()));
        assert!(matches!(
            ta1.await.unwrap(),
            SessionOutcome::Closed {
                cause: CloseCause::Signalled(_),
                ..
            }
        ));

        // Bob sees the new connection come online and never sees alice leave.
        assert_eq!(
            sync(&mut b).await,
            vec![ServerEvent::user_status(UserId(1), true)]
        );
        assert!(h.hub.sessions().is_online(UserId(1)));
        assert!(h.hub.memberships().contains(UserId(1), ROOM));
        assert!(sync(&mut a2).await.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_reports_to_sender_only() {
        let h = Harness::new();
        h.dir.set_accepting_writes(false);
        let (mut a, _ta) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;
        assert_eq!(sync(&mut a).await.len(), 1);

        a.send_json(&json!({"type": "message", "room_id": 7, "content": "lost"}));

        let Some(ServerEvent::Error(notice)) = a.next_event().await else {
            panic!("expected error notice");
        };
        assert_eq!(notice.code, 503);
        assert_eq!(notice.room_id, Some(ROOM));
        assert!(sync(&mut b).await.is_empty());
        assert_eq!(h.dir.append_count(), 1);
    }

    #[tokio::test]
    async fn test_typing_excludes_sender() {
        let h = Harness::new();
        let (mut a, _ta) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;
        assert_eq!(sync(&mut a).await.len(), 1);

        a.send_json(&json!({"type": "typing", "room_id": 7, "is_typing": true}));

        assert_eq!(
            b.next_event().await,
            Some(ServerEvent::typing(UserId(1), ROOM, true))
        );
        assert!(sync(&mut a).await.is_empty());
    }

    #[tokio::test]
    async fn test_join_is_verified_and_leave_is_not() {
        let h = Harness::new();
        let (a, _ta) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;
        let (mut c, _tc) = h.connect("tok-carol", UserId(3)).await;

        c.send_json(&json!({"type": "join_talkroom", "talkroom_id": 7}));
        c.send_json(&json!({"type": "leave_talkroom", "talkroom_id": 7}));
        assert!(sync(&mut c).await.is_empty());
        a.send_json(&json!({"type": "join_talkroom", "room_id": 7}));

        assert_eq!(
            b.next_event().await,
            Some(ServerEvent::user_left(&profile(3, "carol"), ROOM))
        );
        assert_eq!(
            b.next_event().await,
            Some(ServerEvent::user_joined(&profile(1, "alice"), ROOM))
        );
    }

    #[tokio::test]
    async fn test_membership_reconciled_on_check() {
        let h = Harness::new();
        let (a, _ta) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;
        let (mut c, _tc) = h.connect("tok-carol", UserId(3)).await;
        assert!(!h.hub.memberships().contains(UserId(3), ROOM));

        h.dir.add_member(ROOM, UserId(3));
        c.send_json(&json!({"type": "typing", "room_id": 7, "is_typing": false}));
        assert!(sync(&mut c).await.is_empty());

        assert!(h.hub.memberships().contains(UserId(3), ROOM));
        assert_eq!(
            b.next_event().await,
            Some(ServerEvent::typing(UserId(3), ROOM, false))
        );

        a.send_json(&json!({"type": "message", "room_id": 7, "content": "welcome"}));
        let Some(ServerEvent::Message(record)) = c.next_event().await else {
            panic!("expected message on carol");
        };
        assert_eq!(record.content, "welcome");

        // Removal is picked up the same way.
        h.dir.remove_member(ROOM, UserId(3));
        c.send_json(&json!({"type": "typing", "room_id": 7, "is_typing": true}));
        assert!(sync(&mut c).await.is_empty());
        assert!(!h.hub.memberships().contains(UserId(3), ROOM));
    }

    #[tokio::test]
    async fn test_capacity_refuses_new_users_only() {
        let h = Harness::with_config(HubConfig {
            max_connections: 1,
            ..HubConfig::default()
        });
        let (_a, _ta) = h.connect("tok-alice", UserId(1)).await;
        let first = h.hub.sessions().connection_id(UserId(1));

        let (mut c, tc) = h.spawn("tok-carol");
        assert_eq!(
            c.closed().await.map(|r| r.code),
            Some(CloseReason::TRY_AGAIN_LATER)
        );
        assert_eq!(tc.await.unwrap(), SessionOutcome::Refused(UserId(3)));

        let (_a2, _ta2) = h.spawn("tok-alice");
        let hub = Arc::clone(&h.hub);
        eventually(|| hub.sessions().connection_id(UserId(1)) != first).await;
        assert_eq!(h.hub.sessions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_closed() {
        let h = Harness::with_config(HubConfig {
            heartbeat_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(3),
            ..HubConfig::default()
        });
        let (mut a, ta) = h.connect("tok-alice", UserId(1)).await;

        let mut pings = 0;
        let reason = loop {
            match a.recv().await {
                Some(Outgoing::Ping) => pings += 1,
                Some(Outgoing::Close(reason)) => break reason,
                Some(Outgoing::Payload(_)) => {}
                None => panic!("closed without a close frame"),
            }
        };

        assert!(pings >= 1);
        assert_eq!(reason.code, CloseReason::GOING_AWAY);
        assert!(matches!(
            ta.await.unwrap(),
            SessionOutcome::Closed {
                cause: CloseCause::IdleTimeout,
                ..
            }
        ));
        assert!(h.hub.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_replaced_during_membership_load_leaves_no_stale_entry() {
        let dir = Harness::seeded();
        let gate = Gate::new();
        let members = Arc::new(GatedMemberships {
            dir: Arc::clone(&dir),
            gate: Arc::clone(&gate),
        });
        let h = Harness::with_stores(Arc::clone(&dir), members, dir);

        // The first alice connection stalls while loading its rooms.
        let (mut a1, ta1) = h.spawn("tok-alice");
        let g = Arc::clone(&gate);
        eventually(|| g.reached()).await;
        let first = h.hub.sessions().connection_id(UserId(1));

        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;
        let (mut a2, ta2) = h.spawn("tok-alice");
        let hub = Arc::clone(&h.hub);
        eventually(|| {
            hub.sessions().connection_id(UserId(1)) != first && hub.memberships().is_indexed(UserId(1))
        })
        .await;

        gate.open();
        assert_eq!(a1.closed().await, Some(CloseReason::replaced()));
        assert!(matches!(
            ta1.await.unwrap(),
            SessionOutcome::Closed {
                cause: CloseCause::Signalled(_),
                ..
            }
        ));
        assert_eq!(h.hub.memberships().rooms_of(UserId(1)), HashSet::from([ROOM]));

        a2.disconnect();
        assert!(matches!(
            ta2.await.unwrap(),
            SessionOutcome::Closed {
                cause: CloseCause::ClientClosed,
                ..
            }
        ));

        assert!(!h.hub.sessions().is_online(UserId(1)));
        assert!(!h.hub.memberships().is_indexed(UserId(1)));
        assert!(h.hub.memberships().rooms_of(UserId(1)).is_empty());
        assert_eq!(h.hub.online_members(ROOM), vec![UserId(2)]);
        assert_eq!(
            sync(&mut b).await,
            vec![
                ServerEvent::user_status(UserId(1), true),
                ServerEvent::user_status(UserId(1), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_message_in_flight_is_delivered_after_sender_leaves() {
        let dir = Harness::seeded();
        let gate = Gate::new();
        let messages = Arc::new(GatedMessages {
            dir: Arc::clone(&dir),
            gate: Arc::clone(&gate),
        });
        let h = Harness::with_stores(Arc::clone(&dir), dir, messages);
        let (mut a, ta) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;

        a.send_json(&json!({"type": "message", "room_id": 7, "content": "last words"}));
        let g = Arc::clone(&gate);
        eventually(|| g.reached()).await;
        a.disconnect();
        gate.open();

        let Some(ServerEvent::Message(record)) = b.next_event().await else {
            panic!("expected message on bob");
        };
        assert_eq!(record.content, "last words");
        assert_eq!(record.sender_id, UserId(1));
        assert_eq!(
            b.next_event().await,
            Some(ServerEvent::user_status(UserId(1), false))
        );
        assert!(matches!(
            ta.await.unwrap(),
            SessionOutcome::Closed {
                cause: CloseCause::ClientClosed,
                ..
            }
        ));
        assert_eq!(h.dir.append_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writer_is_aborted() {
        let h = Harness::new();
        let (source, _unused, mut peer) = memory::pair();
        let dropped = Arc::new(AtomicBool::new(false));
        let sink = StalledSink {
            dropped: Arc::clone(&dropped),
        };
        let hub = Arc::clone(&h.hub);
        let task =
            tokio::spawn(async move { Dispatcher::new(hub).run("tok-alice", source, sink).await });
        eventually(|| h.hub.sessions().is_online(UserId(1))).await;

        // The pong wedges the writer in its first send.
        assert!(peer.send_json(&json!({"type": "ping"})));
        peer.disconnect();

        assert!(matches!(
            task.await.unwrap(),
            SessionOutcome::Closed {
                cause: CloseCause::ClientClosed,
                ..
            }
        ));
        eventually(|| dropped.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_invalid_utf8_binary_frame_is_dropped() {
        let h = Harness::new();
        let (mut a, _ta) = h.connect("tok-alice", UserId(1)).await;
        let (mut b, _tb) = h.connect("tok-bob", UserId(2)).await;
        assert_eq!(sync(&mut a).await.len(), 1);

        let mut garbled = br#"{"type":"message","room_id":7,"content":"caf"#.to_vec();
        garbled.extend_from_slice(&[0xe9, b'"', b'}']);
        assert!(a.send_binary(garbled));
        assert!(a.send_binary(br#"{"type":"typing","room_id":7,"is_typing":true}"#.to_vec()));

        assert_eq!(
            b.next_event().await,
            Some(ServerEvent::typing(UserId(1), ROOM, true))
        );
        assert!(h.hub.sessions().is_online(UserId(1)));
        assert_eq!(h.dir.append_count(), 0);
    }
}
