//! Shared fixtures for talkroom benchmarks.

use std::sync::Arc;
use talkroom_core::connection::{ConnectionHandle, Outbound, OutboundQueue};
use talkroom_core::{Hub, HubConfig, InMemoryDirectory};
use talkroom_protocol::{RoomId, UserId, UserProfile};

/// Queue capacity used by fixtures, large enough that benches never evict.
pub const FIXTURE_QUEUE_CAPACITY: usize = 1 << 16;

/// A hub with registered connections whose queues the bench drains itself.
pub struct RoomFixture {
    pub hub: Arc<Hub>,
    queues: Vec<OutboundQueue>,
}

impl RoomFixture {
    /// Register `members` users, all in every room of `rooms`.
    #[must_use]
    pub fn new(members: usize, rooms: &[RoomId]) -> Self {
        let hub = Arc::new(Hub::with_directory(
            HubConfig::default(),
            Arc::new(InMemoryDirectory::new()),
        ));

        let queues = (1..=members as i64)
            .map(|id| {
                let (handle, queue) = ConnectionHandle::new(FIXTURE_QUEUE_CAPACITY);
                hub.admit(UserId(id), handle);
                hub.memberships().populate(UserId(id), rooms.iter().copied());
                queue
            })
            .collect();

        Self { hub, queues }
    }

    /// Drain every queue, returning the number of events removed.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        for queue in &mut self.queues {
            while let Some(item) = queue.try_recv() {
                if matches!(item, Outbound::Event(_)) {
                    count += 1;
                }
            }
        }
        count
    }
}

/// A directory with `users` users sharing one room.
///
/// User `n` authenticates with the credential `bench-n`.
#[must_use]
pub fn shared_room_directory(users: usize, room_id: RoomId) -> Arc<InMemoryDirectory> {
    let directory = InMemoryDirectory::new();
    for id in 1..=users as i64 {
        directory.add_user(UserProfile::new(UserId(id), format!("bench{id}")));
        directory.issue_credential(credential(id), UserId(id), None);
        directory.add_member(room_id, UserId(id));
    }
    Arc::new(directory)
}

/// Credential issued by [`shared_room_directory`] for user `id`.
#[must_use]
pub fn credential(id: i64) -> String {
    format!("bench-{id}")
}
