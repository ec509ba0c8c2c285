//! In-memory implementation of the collaborator traits.
//!
//! Backs development servers, tests and benchmarks. Users, credentials and
//! room membership are seeded up front and may be changed while running.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use talkroom_protocol::{MessageRecord, RoomId, UserId, UserProfile};
use tracing::debug;

use crate::store::{
    AuthError, Authenticator, MembershipStore, MessageStore, NewMessage, StoreError,
};

/// Number of recent append attempts kept for inspection.
pub const RECENT_APPENDS: usize = 128;

#[derive(Debug, Clone)]
struct UserRecord {
    profile: UserProfile,
    active: bool,
}

#[derive(Debug, Clone, Copy)]
struct Credential {
    user_id: UserId,
    expires_at: Option<DateTime<Utc>>,
}

/// Users, credentials, memberships and messages held in memory.
#[derive(Debug)]
pub struct InMemoryDirectory {
    users: DashMap<UserId, UserRecord>,
    credentials: DashMap<String, Credential>,
    rooms: DashMap<RoomId, HashSet<UserId>>,
    next_message_id: AtomicI64,
    accepting_writes: AtomicBool,
    append_count: AtomicUsize,
    recent: Mutex<VecDeque<NewMessage>>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self {
            users: DashMap::new(),
            credentials: DashMap::new(),
            rooms: DashMap::new(),
            next_message_id: AtomicI64::new(1),
            accepting_writes: AtomicBool::new(true),
            append_count: AtomicUsize::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_APPENDS)),
        }
    }
}

impl InMemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an active user.
    pub fn add_user(&self, profile: UserProfile) {
        self.users.insert(
            profile.id,
            UserRecord {
                profile,
                active: true,
            },
        );
    }

    /// Enable or disable a user account.
    pub fn set_active(&self, user_id: UserId, active: bool) {
        if let Some(mut record) = self.users.get_mut(&user_id) {
            record.active = active;
        }
    }

    /// Issue a credential for a user, optionally expiring.
    pub fn issue_credential(
        &self,
        credential: impl Into<String>,
        user_id: UserId,
        expires_at: Option<DateTime<Utc>>,
    ) {
        self.credentials.insert(
            credential.into(),
            Credential {
                user_id,
                expires_at,
            },
        );
    }

    /// Revoke a credential.
    pub fn revoke_credential(&self, credential: &str) -> bool {
        self.credentials.remove(credential).is_some()
    }

    /// Add a user to a room.
    pub fn add_member(&self, room_id: RoomId, user_id: UserId) {
        self.rooms.entry(room_id).or_default().insert(user_id);
    }

    /// Remove a user from a room.
    pub fn remove_member(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.rooms
            .get_mut(&room_id)
            .is_some_and(|mut members| members.remove(&user_id))
    }

    /// Make message appends succeed or fail.
    pub fn set_accepting_writes(&self, accepting: bool) {
        self.accepting_writes.store(accepting, Ordering::SeqCst);
    }

    /// Number of append attempts seen, including failed ones.
    #[must_use]
    pub fn append_count(&self) -> usize {
        self.append_count.load(Ordering::SeqCst)
    }

    /// The last [`RECENT_APPENDS`] append attempts, oldest first.
    #[must_use]
    pub fn appended(&self) -> Vec<NewMessage> {
        self.recent.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl Authenticator for InMemoryDirectory {
    async fn authenticate(&self, credential: &str) -> Result<UserProfile, AuthError> {
        if credential.is_empty() || credential.chars().any(char::is_whitespace) {
            return Err(AuthError::Malformed);
        }

        let grant = self
            .credentials
            .get(credential)
            .map(|c| *c)
            .ok_or(AuthError::Invalid)?;

        if grant.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(AuthError::Expired);
        }

        let record = self
            .users
            .get(&grant.user_id)
            .map(|r| r.value().clone())
            .ok_or(AuthError::Invalid)?;

        if !record.active {
            return Err(AuthError::Inactive(grant.user_id));
        }

        Ok(record.profile)
    }
}

#[async_trait]
impl MembershipStore for InMemoryDirectory {
    async fn load_memberships(&self, user_id: UserId) -> Result<HashSet<RoomId>, StoreError> {
        Ok(self
            .rooms
            .iter()
            .filter(|entry| entry.value().contains(&user_id))
            .map(|entry| *entry.key())
            .collect())
    }

    async fn verify_membership(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .rooms
            .get(&room_id)
            .is_some_and(|members| members.contains(&user_id)))
    }
}

#[async_trait]
impl MessageStore for InMemoryDirectory {
    async fn append_message(&self, message: NewMessage) -> Result<MessageRecord, StoreError> {
        self.append_count.fetch_add(1, Ordering::SeqCst);
        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_APPENDS {
                recent.pop_front();
            }
            recent.push_back(message.clone());
        }

        if !self.accepting_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }

        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let sender = self
            .users
            .get(&message.sender_id)
            .map(|r| r.profile.clone());

        debug!(message_id = id, room_id = %message.room_id, "Message stored");

        Ok(MessageRecord {
            id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            content: message.content,
            message_type: message.message_type,
            reply_to_id: message.reply_to_id,
            created_at: Utc::now(),
            sender,
        })
    }
}
