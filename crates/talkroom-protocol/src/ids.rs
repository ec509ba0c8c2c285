//! Identifier types shared by frames and events.
//!
//! Users, rooms and messages are addressed by the integer keys the
//! persistence layer assigns. The newtypes keep them from being mixed up.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a message assigned by the persistence layer.
pub type MessageId = i64;

/// Identifier of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Identifier of a room (talkroom).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub i64);

impl UserId {
    /// Get the raw key.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl RoomId {
    /// Get the raw key.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<i64> for RoomId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_integers() {
        assert_eq!(serde_json::to_string(&UserId(7)).unwrap(), "7");
        let room: RoomId = serde_json::from_str("42").unwrap();
        assert_eq!(room, RoomId(42));
    }

    #[test]
    fn test_id_display() {
        assert_eq!(UserId(3).to_string(), "3");
        assert_eq!(RoomId::from(9).to_string(), "9");
    }
}
