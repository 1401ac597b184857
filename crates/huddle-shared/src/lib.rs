//! # huddle-shared
//!
//! Types shared by the Huddle store and server: canonical identifiers, the
//! error taxonomy, the realtime wire protocol, the Encryption Gateway and
//! identity token verification.

pub mod auth;
pub mod clock;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ChatError, ChatResult, ErrorKind};
pub use types::{AttachmentId, AttachmentRef, AuditEventId, ChatId, ChatKind, MessageId, UserId};
