//! Collaborator contracts.
//!
//! The core never owns user accounts, room membership or message history.
//! It reaches them through these traits so deployments can plug in their own
//! backends.

use async_trait::async_trait;
use std::collections::HashSet;
use talkroom_protocol::{MessageId, MessageRecord, MessageType, RoomId, UserId, UserProfile};
use thiserror::Error;

/// Authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The credential could not be parsed.
    #[error("Malformed credential")]
    Malformed,

    /// The credential is unknown or its subject does not exist.
    #[error("Invalid credential")]
    Invalid,

    /// The credential has expired.
    #[error("Credential expired")]
    Expired,

    /// The account is disabled.
    #[error("User {0} is inactive")]
    Inactive(UserId),

    /// The backend could not be reached.
    #[error("Authentication unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Malformed => "malformed",
            AuthError::Invalid => "invalid",
            AuthError::Expired => "expired",
            AuthError::Inactive(_) => "inactive",
            AuthError::Unavailable(_) => "unavailable",
        }
    }
}

/// Storage failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the write.
    #[error("Store rejected request: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Status code reported to the client in an `error` event.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            StoreError::Unavailable(_) => 503,
            StoreError::Rejected(_) => 422,
        }
    }
}

/// A message about to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to_id: Option<MessageId>,
}

impl NewMessage {
    /// Create a text message.
    #[must_use]
    pub fn text(
        room_id: RoomId,
        sender_id: UserId,
        content: impl Into<String>,
        reply_to_id: Option<MessageId>,
    ) -> Self {
        Self {
            room_id,
            sender_id,
            content: content.into(),
            message_type: MessageType::Text,
            reply_to_id,
        }
    }
}

/// Resolves a connection credential to a user.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate a credential.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] if the credential does not identify an
    /// active user.
    async fn authenticate(&self, credential: &str) -> Result<UserProfile, AuthError>;
}

/// Authoritative room membership.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Load every room a user belongs to.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend cannot answer.
    async fn load_memberships(&self, user_id: UserId) -> Result<HashSet<RoomId>, StoreError>;

    /// Check whether a user currently belongs to a room.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend cannot answer.
    async fn verify_membership(&self, user_id: UserId, room_id: RoomId)
        -> Result<bool, StoreError>;
}

/// Message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, returning the stored record.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the message was not stored.
    async fn append_message(&self, message: NewMessage) -> Result<MessageRecord, StoreError>;
}
