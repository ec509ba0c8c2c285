//! Frame and event types for the talkroom channel.
//!
//! Clients send flat JSON objects discriminated by `type`. The server answers
//! with `{"type": ..., "data": {...}}` envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, RoomId, UserId};

/// Frame kinds a client may send.
pub const CLIENT_FRAME_KINDS: [&str; 5] = [
    "message",
    "typing",
    "join_talkroom",
    "leave_talkroom",
    "ping",
];

/// A frame received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Post a message to a room.
    Message {
        /// Target room.
        #[serde(alias = "talkroom_id")]
        room_id: RoomId,
        /// Message body. Must not be empty.
        content: String,
        /// Message being replied to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<MessageId>,
    },

    /// Typing indicator for a room.
    Typing {
        /// Target room.
        #[serde(alias = "talkroom_id")]
        room_id: RoomId,
        /// Whether the user is currently typing.
        is_typing: bool,
    },

    /// Announce presence in a room.
    JoinTalkroom {
        /// Target room.
        #[serde(alias = "talkroom_id")]
        room_id: RoomId,
    },

    /// Announce leaving a room.
    LeaveTalkroom {
        /// Target room.
        #[serde(alias = "talkroom_id")]
        room_id: RoomId,
    },

    /// Application-level keepalive.
    Ping {},
}

impl ClientFrame {
    /// Get the wire name of this frame kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Message { .. } => "message",
            ClientFrame::Typing { .. } => "typing",
            ClientFrame::JoinTalkroom { .. } => "join_talkroom",
            ClientFrame::LeaveTalkroom { .. } => "leave_talkroom",
            ClientFrame::Ping {} => "ping",
        }
    }

    /// Get the room this frame targets, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            ClientFrame::Message { room_id, .. }
            | ClientFrame::Typing { room_id, .. }
            | ClientFrame::JoinTalkroom { room_id }
            | ClientFrame::LeaveTalkroom { room_id } => Some(*room_id),
            ClientFrame::Ping {} => None,
        }
    }
}

/// Public profile of a user, attached to messages and room notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User identifier.
    pub id: UserId,
    /// Login name.
    pub username: String,
    /// Display name.
    #[serde(default)]
    pub full_name: Option<String>,
    /// Avatar location.
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl UserProfile {
    /// Create a profile with only the required fields.
    #[must_use]
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            full_name: None,
            avatar_url: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }
}

/// Kind of stored message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Plain text.
    #[default]
    Text,
    /// Image attachment.
    Image,
    /// File attachment.
    File,
    /// Server generated.
    System,
}

/// A message as stored by the persistence layer.
///
/// This is the canonical record broadcast to a room, including the
/// server-assigned id and creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Assigned message id.
    pub id: MessageId,
    /// Room the message belongs to.
    pub room_id: RoomId,
    /// Author.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
    /// Kind of message.
    #[serde(default)]
    pub message_type: MessageType,
    /// Message being replied to, if any.
    pub reply_to_id: Option<MessageId>,
    /// When the message was stored.
    pub created_at: DateTime<Utc>,
    /// Author profile, when known to the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserProfile>,
}

/// Typing indicator payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    /// User who is typing.
    pub user_id: UserId,
    /// Room being typed in.
    pub room_id: RoomId,
    /// Whether the user is typing.
    pub is_typing: bool,
}

/// Join/leave notice payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomNotice {
    /// User joining or leaving.
    pub user_id: UserId,
    /// Login name.
    pub username: String,
    /// Display name.
    pub full_name: Option<String>,
    /// Room concerned.
    pub room_id: RoomId,
}

impl RoomNotice {
    /// Build a notice for `profile` in `room_id`.
    #[must_use]
    pub fn new(profile: &UserProfile, room_id: RoomId) -> Self {
        Self {
            user_id: profile.id,
            username: profile.username.clone(),
            full_name: profile.full_name.clone(),
            room_id,
        }
    }
}

/// Presence change payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotice {
    /// User whose presence changed.
    pub user_id: UserId,
    /// New presence.
    pub is_online: bool,
}

/// Keepalive response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongData {
    /// Server time in unix milliseconds.
    pub timestamp: u64,
}

/// Error notice sent to the originating connection only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// Error code.
    pub code: u16,
    /// Human-readable message.
    pub message: String,
    /// Room the failed request targeted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

/// An event pushed from the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A stored message.
    Message(MessageRecord),
    /// Typing indicator.
    Typing(TypingNotice),
    /// A user announced presence in a room.
    UserJoined(RoomNotice),
    /// A user announced leaving a room.
    UserLeft(RoomNotice),
    /// A user went online or offline.
    UserStatus(StatusNotice),
    /// Keepalive response.
    Pong(PongData),
    /// Request failure.
    Error(ErrorNotice),
}

impl ServerEvent {
    /// Get the wire name of this event kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Message(_) => "message",
            ServerEvent::Typing(_) => "typing",
            ServerEvent::UserJoined(_) => "user_joined",
            ServerEvent::UserLeft(_) => "user_left",
            ServerEvent::UserStatus(_) => "user_status",
            ServerEvent::Pong(_) => "pong",
            ServerEvent::Error(_) => "error",
        }
    }

    /// Get the room this event belongs to. Global events have none.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            ServerEvent::Message(record) => Some(record.room_id),
            ServerEvent::Typing(notice) => Some(notice.room_id),
            ServerEvent::UserJoined(notice) | ServerEvent::UserLeft(notice) => {
                Some(notice.room_id)
            }
            ServerEvent::Error(notice) => notice.room_id,
            ServerEvent::UserStatus(_) | ServerEvent::Pong(_) => None,
        }
    }

    /// Create a typing event.
    #[must_use]
    pub fn typing(user_id: UserId, room_id: RoomId, is_typing: bool) -> Self {
        ServerEvent::Typing(TypingNotice {
            user_id,
            room_id,
            is_typing,
        })
    }

    /// Create a join notice.
    #[must_use]
    pub fn user_joined(profile: &UserProfile, room_id: RoomId) -> Self {
        ServerEvent::UserJoined(RoomNotice::new(profile, room_id))
    }

    /// Create a leave notice.
    #[must_use]
    pub fn user_left(profile: &UserProfile, room_id: RoomId) -> Self {
        ServerEvent::UserLeft(RoomNotice::new(profile, room_id))
    }

    /// Create a presence event.
    #[must_use]
    pub fn user_status(user_id: UserId, is_online: bool) -> Self {
        ServerEvent::UserStatus(StatusNotice { user_id, is_online })
    }

    /// Create a pong carrying the current server time.
    #[must_use]
    pub fn pong_now() -> Self {
        let timestamp = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        ServerEvent::Pong(PongData { timestamp })
    }

    /// Create an error notice.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>, room_id: Option<RoomId>) -> Self {
        ServerEvent::Error(ErrorNotice {
            code,
            message: message.into(),
            room_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_kind() {
        let frame = ClientFrame::JoinTalkroom { room_id: RoomId(1) };
        assert_eq!(frame.kind(), "join_talkroom");
        assert_eq!(frame.room_id(), Some(RoomId(1)));
        assert_eq!(ClientFrame::Ping {}.room_id(), None);

        for kind in CLIENT_FRAME_KINDS {
            assert!(!kind.is_empty());
        }
    }

    #[test]
    fn test_message_frame_accepts_talkroom_alias() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "message",
            "talkroom_id": 7,
            "content": "hi"
        }))
        .unwrap();

        assert_eq!(
            frame,
            ClientFrame::Message {
                room_id: RoomId(7),
                content: "hi".to_string(),
                reply_to_id: None,
            }
        );
    }

    #[test]
    fn test_server_event_envelope_shape() {
        let event = ServerEvent::user_status(UserId(4), false);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(
            value,
            json!({"type": "user_status", "data": {"user_id": 4, "is_online": false}})
        );
        assert_eq!(event.room_id(), None);
    }

    #[test]
    fn test_room_notice_copies_profile() {
        let profile = UserProfile::new(UserId(2), "bob").with_full_name("Bob B");
        let event = ServerEvent::user_joined(&profile, RoomId(5));

        assert_eq!(event.kind(), "user_joined");
        assert_eq!(event.room_id(), Some(RoomId(5)));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"]["username"], "bob");
        assert_eq!(value["data"]["full_name"], "Bob B");
    }

    #[test]
    fn test_message_record_serializes_created_at_as_rfc3339() {
        let record = MessageRecord {
            id: 11,
            room_id: RoomId(7),
            sender_id: UserId(1),
            content: "hello".to_string(),
            message_type: MessageType::Text,
            reply_to_id: None,
            created_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            sender: None,
        };

        let value = serde_json::to_value(ServerEvent::Message(record)).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["data"]["id"], 11);
        assert_eq!(value["data"]["message_type"], "text");
        assert_eq!(value["data"]["created_at"], "2024-05-01T10:00:00Z");
    }
}
