//! # talkroom-protocol
//!
//! Wire protocol definitions for the talkroom realtime channel.
//!
//! This crate defines the JSON frames exchanged between chat clients and the
//! server, the canonical message record and the codec.
//!
//! ## Frame Types
//!
//! - `message` / `typing` - Room traffic from clients
//! - `join_talkroom` / `leave_talkroom` - Advisory room notices
//! - `ping` / `pong` - Application keepalive
//! - `user_joined` / `user_left` / `user_status` - Presence events
//!
//! ## Example
//!
//! ```rust
//! use talkroom_protocol::{codec, RoomId, ServerEvent, UserId};
//!
//! let frame = codec::decode(r#"{"type":"typing","room_id":7,"is_typing":true}"#).unwrap();
//! assert_eq!(frame.room_id(), Some(RoomId(7)));
//!
//! let encoded = codec::encode(&ServerEvent::user_status(UserId(1), true)).unwrap();
//! assert!(!encoded.is_empty());
//! ```

pub mod codec;
pub mod frames;
pub mod ids;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{
    ClientFrame, ErrorNotice, MessageRecord, MessageType, PongData, RoomNotice, ServerEvent,
    StatusNotice, TypingNotice, UserProfile,
};
pub use ids::{MessageId, RoomId, UserId};
