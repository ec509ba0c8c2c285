//! # talkroom-core
//!
//! Presence, membership and event routing for the talkroom realtime channel.
//!
//! This crate provides the building blocks behind every connection:
//!
//! - **SessionRegistry** - one live connection per user
//! - **MembershipIndex** - cached user/room membership for connected users
//! - **BroadcastRouter** - fan-out of encoded events to room members
//! - **Dispatcher** - per-connection lifecycle and inbound frame handling
//!
//! Users, rooms and message history live behind the collaborator traits in
//! [`store`]; [`InMemoryDirectory`] implements all of them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────────┐
//! │ Dispatcher  │────▶│   Router    │────▶│ SessionRegistry │
//! └─────────────┘     └─────────────┘     └─────────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌─────────────┐     ┌─────────────────┐
//! │   Stores    │────▶│ MembershipIndex │
//! └─────────────┘     └─────────────────┘
//! ```

pub mod connection;
pub mod directory;
pub mod dispatcher;
pub mod hub;
pub mod membership;
pub mod metrics;
pub mod router;
pub mod session;
pub mod store;

pub use connection::{ConnectionHandle, SendError};
pub use directory::InMemoryDirectory;
pub use dispatcher::{CloseCause, ConnectionState, Dispatcher, SessionOutcome};
pub use hub::{Hub, HubConfig, HubStats};
pub use membership::MembershipIndex;
pub use router::{BroadcastRouter, DeliveryReport};
pub use session::SessionRegistry;
pub use store::{AuthError, Authenticator, MembershipStore, MessageStore, NewMessage, StoreError};
