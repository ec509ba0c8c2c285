//! Broadcast router.
//!
//! Resolves recipients for an event, encodes it once and pushes the bytes to
//! each recipient's connection. One slow or broken recipient never holds up
//! the others: delivery is a non-blocking enqueue and failures are recorded
//! per recipient.

use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use talkroom_protocol::{codec, RoomId, ServerEvent, UserId};
use tracing::{error, trace};

use crate::connection::SendError;
use crate::membership::MembershipIndex;
use crate::metrics;
use crate::session::SessionRegistry;

/// Outcome of one delivery attempt, per recipient.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    outcomes: Vec<(UserId, Result<(), SendError>)>,
}

impl DeliveryReport {
    /// Recipients attempted, in ascending user ID order.
    #[must_use]
    pub fn recipients(&self) -> Vec<UserId> {
        self.outcomes.iter().map(|(user_id, _)| *user_id).collect()
    }

    /// Per-recipient results.
    #[must_use]
    pub fn outcomes(&self) -> &[(UserId, Result<(), SendError>)] {
        &self.outcomes
    }

    /// Number of successful enqueues.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_ok()).count()
    }

    /// Number of failed enqueues.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }

    /// Check whether nobody was addressed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Delivers server events to connected users.
#[derive(Debug, Clone)]
pub struct BroadcastRouter {
    sessions: Arc<SessionRegistry>,
    memberships: Arc<MembershipIndex>,
}

impl BroadcastRouter {
    /// Create a router over a registry and membership index.
    #[must_use]
    pub fn new(sessions: Arc<SessionRegistry>, memberships: Arc<MembershipIndex>) -> Self {
        Self {
            sessions,
            memberships,
        }
    }

    /// Send an event to one user.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`] if the user is offline or their queue rejected
    /// the event.
    pub fn unicast(&self, user_id: UserId, event: &ServerEvent) -> Result<(), SendError> {
        let Some(payload) = Self::encode(event) else {
            return Err(SendError::Closed);
        };
        let result = self.sessions.send(user_id, payload);
        metrics::record_delivery(event.kind(), result.as_ref().err());
        result
    }

    /// Send an event to every online member of a room.
    pub fn broadcast_to_room(
        &self,
        room_id: RoomId,
        event: &ServerEvent,
        exclude: Option<UserId>,
    ) -> DeliveryReport {
        self.broadcast_to_rooms([room_id], event, exclude)
    }

    /// Send an event once to every online member of any of `rooms`.
    ///
    /// A user sharing several of the rooms receives a single copy.
    pub fn broadcast_to_rooms(
        &self,
        rooms: impl IntoIterator<Item = RoomId>,
        event: &ServerEvent,
        exclude: Option<UserId>,
    ) -> DeliveryReport {
        let mut recipients = BTreeSet::new();
        for room_id in rooms {
            recipients.extend(self.memberships.online_members_of(room_id, &self.sessions));
        }
        if let Some(excluded) = exclude {
            recipients.remove(&excluded);
        }

        self.deliver(event, recipients)
    }

    /// Send an event to every connected user.
    pub fn broadcast_to_all(&self, event: &ServerEvent) -> DeliveryReport {
        let recipients: BTreeSet<UserId> = self.sessions.online_users().into_iter().collect();
        self.deliver(event, recipients)
    }

    fn deliver(&self, event: &ServerEvent, recipients: BTreeSet<UserId>) -> DeliveryReport {
        if recipients.is_empty() {
            return DeliveryReport::default();
        }
        let Some(payload) = Self::encode(event) else {
            return DeliveryReport::default();
        };

        let kind = event.kind();
        let outcomes: Vec<_> = recipients
            .into_iter()
            .map(|user_id| {
                // Bytes clones share the encoded buffer.
                let result = self.sessions.send(user_id, payload.clone());
                metrics::record_delivery(kind, result.as_ref().err());
                if let Err(e) = &result {
                    trace!(user_id = %user_id, event = kind, error = %e, "Delivery failed");
                }
                (user_id, result)
            })
            .collect();

        let report = DeliveryReport { outcomes };
        trace!(
            event = kind,
            delivered = report.delivered(),
            failed = report.failed(),
            "Broadcast complete"
        );
        report
    }

    fn encode(event: &ServerEvent) -> Option<Bytes> {
        match codec::encode(event) {
            Ok(payload) => Some(payload),
            Err(e) => {
                error!(event = event.kind(), error = %e, "Failed to encode event");
                None
            }
        }
    }
}
