//! # herald-core
//!
//! Core building blocks of the Herald broadcast server:
//!
//! - **Channel** - Named room holding the outboxes of its subscribers
//! - **Router** - Connection registry, room membership and event emission
//! - **Presence** - Per-channel member lists reconciled against live connections
//! - **Envelope** - Decoded inbound events and the dispatch seam
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Adapter   │────▶│ Dispatcher  │────▶│   Router    │────▶ connections
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                           ▲        │ live ids
//!                                    emit   │        ▼
//!                                         ┌─────────────┐     ┌─────────────┐
//!                          join/leave ───▶│  Presence   │◀───▶│ MemberStore │
//!                                         └─────────────┘     └─────────────┘
//! ```

pub mod channel;
pub mod dispatch;
pub mod envelope;
pub mod member;
pub mod presence;
pub mod router;
pub mod store;

pub use channel::{Channel, ChannelId, ChannelKind, Delivery, Inbox, Published};
pub use dispatch::Dispatcher;
pub use envelope::EventEnvelope;
pub use member::{presence_view, Member, PublicMember};
pub use presence::{
    ConnectionOracle, OracleError, PresenceDirectory, PresenceError, PresenceNotifier,
};
pub use router::{Router, RouterConfig, RouterError, RouterStats};
pub use store::{MemberStore, MemoryMemberStore, StoreError};
