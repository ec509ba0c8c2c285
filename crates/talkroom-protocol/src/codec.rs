//! Codec for decoding client frames and encoding server events.
//!
//! Both directions are JSON text. Events are encoded once into [`Bytes`] so a
//! room broadcast shares a single buffer across all recipients.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::frames::{ClientFrame, ServerEvent, CLIENT_FRAME_KINDS};

/// Default maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Received size in bytes.
        size: usize,
        /// Configured limit in bytes.
        max: usize,
    },

    /// Input is not a JSON object.
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The object has no string `type` field.
    #[error("Missing frame type")]
    MissingType,

    /// The `type` field names a kind this server does not handle.
    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    /// A known kind with missing or mistyped fields.
    #[error("Malformed {kind} frame: {source}")]
    Malformed {
        /// Frame kind.
        kind: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::FrameTooLarge { .. } => "too_large",
            ProtocolError::InvalidJson(_) => "invalid_json",
            ProtocolError::MissingType => "missing_type",
            ProtocolError::UnknownType(_) => "unknown_type",
            ProtocolError::Malformed { .. } => "malformed",
            ProtocolError::Encode(_) => "encode",
        }
    }
}

/// Encode an event to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(event: &ServerEvent) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(event)
        .map(Bytes::from)
        .map_err(ProtocolError::Encode)
}

/// Decode a client frame using the default size limit.
///
/// # Errors
///
/// See [`decode_with_limit`].
pub fn decode(text: &str) -> Result<ClientFrame, ProtocolError> {
    decode_with_limit(text, MAX_FRAME_SIZE)
}

/// Decode a client frame.
///
/// Unknown kinds are reported separately from malformed known kinds so the
/// caller can log them differently.
///
/// # Errors
///
/// Returns an error if the frame is too large, not a JSON object, has no
/// `type`, has an unknown `type`, or is missing required fields.
pub fn decode_with_limit(text: &str, max_size: usize) -> Result<ClientFrame, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(ProtocolError::MissingType),
    };

    if !CLIENT_FRAME_KINDS.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
}
