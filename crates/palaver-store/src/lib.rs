//! # palaver-store
//!
//! Durable storage for the chat backend, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! collection: conversations (with participant lists), messages (with read
//! receipts), offline notifications, and presence records. The store offers
//! per-row atomic read-modify-write and no cross-collection transactions;
//! callers sequence dependent writes themselves.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod notifications;
pub mod presence;

mod error;
mod row;

pub use database::Database;
pub use error::{Result, StoreError};
