//! Realtime wire protocol.
//!
//! Every frame is a JSON object `{"event": <name>, "data": {...}}`. One
//! logical channel exists per chat; outbound events are fanned out to every
//! connection subscribed to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AttachmentId, AttachmentRef, ChatId, MessageId, UserId};

/// Commands a connected client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientCommand {
    #[serde(rename = "chats:join", rename_all = "camelCase")]
    Join { chat_id: ChatId },

    #[serde(rename = "message:send", rename_all = "camelCase")]
    Send {
        chat_id: ChatId,
        #[serde(default)]
        text: String,
        #[serde(default)]
        mentions: Vec<UserId>,
        #[serde(default)]
        attachment_ids: Vec<AttachmentId>,
    },

    #[serde(rename = "typing:start", rename_all = "camelCase")]
    TypingStart { chat_id: ChatId },

    #[serde(rename = "typing:stop", rename_all = "camelCase")]
    TypingStop { chat_id: ChatId },

    #[serde(rename = "reaction:toggle", rename_all = "camelCase")]
    ToggleReaction { message_id: MessageId, emoji: String },

    #[serde(rename = "delete:forAll", rename_all = "camelCase")]
    DeleteForAll { message_id: MessageId },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Join { .. } => "chats:join",
            ClientCommand::Send { .. } => "message:send",
            ClientCommand::TypingStart { .. } => "typing:start",
            ClientCommand::TypingStop { .. } => "typing:stop",
            ClientCommand::ToggleReaction { .. } => "reaction:toggle",
            ClientCommand::DeleteForAll { .. } => "delete:forAll",
        }
    }
}

/// Events the server pushes to connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew { message: MessageView },

    #[serde(rename = "message:reactionsUpdated", rename_all = "camelCase")]
    ReactionsUpdated {
        chat_id: ChatId,
        message_id: MessageId,
        reactions: Vec<ReactionGroup>,
    },

    #[serde(rename = "message:deleted", rename_all = "camelCase")]
    MessageDeleted {
        chat_id: ChatId,
        message_id: MessageId,
        deleted_by: UserId,
        deleted_at: DateTime<Utc>,
    },

    #[serde(rename = "typing:started", rename_all = "camelCase")]
    TypingStarted { chat_id: ChatId, user_id: UserId },

    #[serde(rename = "typing:stopped", rename_all = "camelCase")]
    TypingStopped { chat_id: ChatId, user_id: UserId },

    #[serde(rename = "presence:online", rename_all = "camelCase")]
    PresenceOnline { user_id: UserId },

    #[serde(rename = "presence:offline", rename_all = "camelCase")]
    PresenceOffline { user_id: UserId },

    /// Membership, moderation or pins changed; clients refetch the chat.
    #[serde(rename = "chat:updated", rename_all = "camelCase")]
    ChatUpdated { chat_id: ChatId },

    /// Sent only to the connection whose command failed.
    #[serde(rename = "command:rejected")]
    CommandRejected { command: String, error: String },
}

impl ServerEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// All users who reacted with one emoji, in reaction order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionGroup {
    pub emoji: String,
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionInfo {
    pub deleted_by: UserId,
    pub deleted_at: DateTime<Utc>,
}

/// A message as one particular viewer sees it.
///
/// A tombstone (`deleted_for_all`) carries no text, mentions, reactions or
/// attachments, only the deletion metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub mentions: Vec<UserId>,
    pub reactions: Vec<ReactionGroup>,
    pub attachments: Vec<AttachmentRef>,
    pub deleted_for_all: bool,
    pub deletion: Option<DeletionInfo>,
    pub pinned: bool,
}
