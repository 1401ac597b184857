//! # huddle-store
//!
//! Durable state for Huddle, backed by SQLite.
//!
//! Chats are stored as JSON documents and updated by read-modify-write inside
//! a single `IMMEDIATE` transaction. Messages, reactions, per-viewer deletions
//! and the audit log are row tables. The crate exposes a synchronous
//! [`Database`] handle; typed CRUD helpers live on [`Tx`].

pub mod audit;
pub mod chats;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod reactions;

mod error;

pub use database::{Database, Tx};
pub use error::{Result, StoreError};
pub use models::*;
