//! Room membership index.
//!
//! A cache of which rooms each connected user belongs to, kept as two maps
//! (user to rooms and room to users) behind one lock so both sides always
//! agree. The cache is filled from the [`MembershipStore`] when a user
//! connects and corrected whenever an authoritative check disagrees with it.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use talkroom_protocol::{RoomId, UserId};
use tracing::{debug, warn};

use crate::session::SessionRegistry;
use crate::store::{MembershipStore, StoreError};

#[derive(Debug, Default)]
struct Maps {
    by_user: HashMap<UserId, HashSet<RoomId>>,
    by_room: HashMap<RoomId, HashSet<UserId>>,
}

impl Maps {
    fn detach(&mut self, user_id: UserId, rooms: &HashSet<RoomId>) {
        for room_id in rooms {
            if let Some(members) = self.by_room.get_mut(room_id) {
                members.remove(&user_id);
                if members.is_empty() {
                    self.by_room.remove(room_id);
                }
            }
        }
    }

    fn remove_user(&mut self, user_id: UserId) -> Option<HashSet<RoomId>> {
        let rooms = self.by_user.remove(&user_id)?;
        self.detach(user_id, &rooms);
        Some(rooms)
    }
}

/// Bidirectional user/room index for connected users.
#[derive(Debug, Default)]
pub struct MembershipIndex {
    maps: RwLock<Maps>,
}

impl MembershipIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a user's rooms from the store, replacing any prior entry.
    ///
    /// On failure the user is left indexed with no rooms.
    ///
    /// # Errors
    ///
    /// Returns the store error if memberships could not be loaded.
    pub async fn load(&self, user_id: UserId, store: &dyn MembershipStore) -> Result<usize, StoreError> {
        let loaded = store.load_memberships(user_id).await;
        self.apply_loaded(user_id, loaded)
    }

    /// Index the result of a `load_memberships` call.
    ///
    /// # Errors
    ///
    /// Passes the store error through after indexing the user with no rooms.
    pub(crate) fn apply_loaded(
        &self,
        user_id: UserId,
        loaded: Result<HashSet<RoomId>, StoreError>,
    ) -> Result<usize, StoreError> {
        match loaded {
            Ok(rooms) => {
                let count = rooms.len();
                self.populate(user_id, rooms);
                Ok(count)
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to load memberships");
                self.populate(user_id, HashSet::new());
                Err(e)
            }
        }
    }

    /// Replace a user's entry with `rooms`.
    pub fn populate(&self, user_id: UserId, rooms: impl IntoIterator<Item = RoomId>) {
        let rooms: HashSet<RoomId> = rooms.into_iter().collect();
        let mut maps = self.maps.write();

        maps.remove_user(user_id);
        for room_id in &rooms {
            maps.by_room.entry(*room_id).or_default().insert(user_id);
        }

        debug!(user_id = %user_id, rooms = rooms.len(), "Memberships indexed");
        maps.by_user.insert(user_id, rooms);
    }

    /// Remove a user from the index, returning the rooms they were in.
    pub fn drop_user(&self, user_id: UserId) -> HashSet<RoomId> {
        self.maps.write().remove_user(user_id).unwrap_or_default()
    }

    /// Apply the result of an authoritative membership check.
    ///
    /// Only users already in the index are updated. Returns `true` if the
    /// index changed.
    pub fn reconcile(&self, user_id: UserId, room_id: RoomId, is_member: bool) -> bool {
        let mut maps = self.maps.write();
        let Some(rooms) = maps.by_user.get_mut(&user_id) else {
            return false;
        };

        let changed = if is_member {
            rooms.insert(room_id)
        } else {
            rooms.remove(&room_id)
        };
        if !changed {
            return false;
        }

        if is_member {
            maps.by_room.entry(room_id).or_default().insert(user_id);
        } else {
            maps.detach(user_id, &HashSet::from([room_id]));
        }

        debug!(user_id = %user_id, room_id = %room_id, is_member, "Membership reconciled");
        true
    }

    /// Rooms a user is indexed in.
    #[must_use]
    pub fn rooms_of(&self, user_id: UserId) -> HashSet<RoomId> {
        self.maps
            .read()
            .by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Indexed members of a room.
    #[must_use]
    pub fn members_of(&self, room_id: RoomId) -> HashSet<UserId> {
        self.maps
            .read()
            .by_room
            .get(&room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Indexed members of a room who are currently online.
    #[must_use]
    pub fn online_members_of(&self, room_id: RoomId, sessions: &SessionRegistry) -> HashSet<UserId> {
        let mut members = self.members_of(room_id);
        members.retain(|user_id| sessions.is_online(*user_id));
        members
    }

    /// Check whether a user is indexed in a room.
    #[must_use]
    pub fn contains(&self, user_id: UserId, room_id: RoomId) -> bool {
        self.maps
            .read()
            .by_user
            .get(&user_id)
            .is_some_and(|rooms| rooms.contains(&room_id))
    }

    /// Check whether a user has an entry.
    #[must_use]
    pub fn is_indexed(&self, user_id: UserId) -> bool {
        self.maps.read().by_user.contains_key(&user_id)
    }

    /// Number of users indexed.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.maps.read().by_user.len()
    }

    /// Number of rooms with at least one indexed member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.maps.read().by_room.len()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let maps = self.maps.read();
        for (user_id, rooms) in &maps.by_user {
            for room_id in rooms {
                assert!(maps.by_room[room_id].contains(user_id));
            }
        }
        for (room_id, members) in &maps.by_room {
            assert!(!members.is_empty());
            for user_id in members {
                assert!(maps.by_user[user_id].contains(room_id));
            }
        }
    }
}
