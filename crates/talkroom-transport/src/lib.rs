//! # talkroom-transport
//!
//! Transport abstraction layer for the talkroom realtime channel.
//!
//! This crate provides a uniform interface over the duplex channels a chat
//! client connects through:
//!
//! - **WebSocket** - axum upgraded sockets, the production transport
//! - **Memory** - in-process pairs for tests and benchmarks
//!
//! ## Transport Abstraction
//!
//! Every connection is split into a `FrameSource` and a `FrameSink`, so the
//! dispatcher can read while a separate writer task drains the outbound
//! queue.
//!
//! ```rust,ignore
//! use talkroom_transport::{FrameSource, Incoming};
//!
//! async fn read_all(mut source: impl FrameSource) {
//!     while let Ok(Some(Incoming::Text(text))) = source.recv().await {
//!         // Decode and dispatch
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{CloseReason, ConnectionId, FrameSink, FrameSource, Incoming, TransportError};
