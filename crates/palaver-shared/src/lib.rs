//! # palaver-shared
//!
//! Types shared between the palaver server and its storage layer: resolved
//! user identities, the persisted domain model (conversations, messages,
//! notifications, presence), and the JSON event protocol spoken over the
//! WebSocket connection.

pub mod events;
pub mod identity;
pub mod model;

pub use identity::{Identity, IdentityKey, UserKind};
