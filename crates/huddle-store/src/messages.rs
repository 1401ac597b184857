use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use huddle_shared::crypto::SealedText;
use huddle_shared::types::{ChatId, MessageId, UserId};

use crate::database::{conversion_error, from_millis, to_millis, Tx};
use crate::error::{Result, StoreError};
use crate::models::{Message, NewMessage};

const MESSAGE_COLUMNS: &str = "seq, id, chat_id, sender_id, sealed, created_at_ms, mentions,
     attachments, deleted_for_all, deleted_by, deleted_at_ms";

impl Tx<'_> {
    pub fn insert_message(&self, message: &NewMessage) -> Result<Message> {
        let sealed = message
            .sealed
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn().execute(
            "INSERT INTO messages (id, chat_id, sender_id, sealed, created_at_ms, mentions, attachments)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_string(),
                message.chat_id.to_string(),
                message.sender_id.to_string(),
                sealed,
                to_millis(&message.created_at),
                serde_json::to_string(&message.mentions)?,
                serde_json::to_string(&message.attachments)?,
            ],
        )?;

        Ok(Message {
            id: message.id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            sealed: message.sealed.clone(),
            created_at: message.created_at,
            mentions: message.mentions.clone(),
            attachments: message.attachments.clone(),
            deleted_for_all: false,
            deleted_by: None,
            deleted_at: None,
            seq: self.conn().last_insert_rowid(),
        })
    }

    pub fn get_message(&self, id: &MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Messages of a chat the viewer has not deleted for themselves, ordered
    /// by `created_at` then insertion sequence.
    pub fn list_messages_visible_to(&self, chat_id: &ChatId, viewer: &UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             WHERE m.chat_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM message_hidden h
                   WHERE h.message_id = m.id AND h.user_id = ?2
               )
             ORDER BY m.created_at_ms ASC, m.seq ASC"
        ))?;

        let rows = stmt.query_map(
            params![chat_id.to_string(), viewer.to_string()],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// How many messages `sender` wrote in `chat_id` at or after `since`.
    pub fn count_messages_since(
        &self,
        chat_id: &ChatId,
        sender: &UserId,
        since: &DateTime<Utc>,
    ) -> Result<u32> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE chat_id = ?1 AND sender_id = ?2 AND created_at_ms >= ?3",
            params![chat_id.to_string(), sender.to_string(), to_millis(since)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Messages from others, newer than `after`, still visible to the viewer.
    pub fn count_unread(
        &self,
        chat_id: &ChatId,
        viewer: &UserId,
        after: Option<&DateTime<Utc>>,
    ) -> Result<u32> {
        let after_ms = after.map(to_millis).unwrap_or(i64::MIN);
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.chat_id = ?1
               AND m.sender_id != ?2
               AND m.created_at_ms > ?3
               AND m.deleted_for_all = 0
               AND NOT EXISTS (
                   SELECT 1 FROM message_hidden h
                   WHERE h.message_id = m.id AND h.user_id = ?2
               )",
            params![chat_id.to_string(), viewer.to_string(), after_ms],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Hide a message from one viewer. Returns `false` if it already was.
    pub fn hide_message_for(&self, id: &MessageId, user: &UserId, at: &DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO message_hidden (message_id, user_id, hidden_at_ms)
             VALUES (?1, ?2, ?3)",
            params![id.to_string(), user.to_string(), to_millis(at)],
        )?;
        Ok(affected > 0)
    }

    pub fn is_hidden_for(&self, id: &MessageId, user: &UserId) -> Result<bool> {
        let hidden = self
            .conn()
            .query_row(
                "SELECT 1 FROM message_hidden WHERE message_id = ?1 AND user_id = ?2",
                params![id.to_string(), user.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(hidden.is_some())
    }

    /// Tombstone a message for everyone. The flag only ever goes from 0 to 1;
    /// returns `false` if the message was already deleted.
    pub fn mark_deleted_for_all(&self, id: &MessageId, by: &UserId, at: &DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET deleted_for_all = 1, deleted_by = ?2, deleted_at_ms = ?3
             WHERE id = ?1 AND deleted_for_all = 0",
            params![id.to_string(), by.to_string(), to_millis(at)],
        )?;
        Ok(affected > 0)
    }
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| conversion_error(idx, StoreError::from(e)))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let seq: i64 = row.get(0)?;
    let id_str: String = row.get(1)?;
    let chat_id_str: String = row.get(2)?;
    let sender_str: String = row.get(3)?;
    let sealed_json: Option<String> = row.get(4)?;
    let created_ms: i64 = row.get(5)?;
    let mentions_json: String = row.get(6)?;
    let attachments_json: String = row.get(7)?;
    let deleted_for_all: bool = row.get(8)?;
    let deleted_by: Option<String> = row.get(9)?;
    let deleted_ms: Option<i64> = row.get(10)?;

    let sealed: Option<SealedText> = sealed_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion_error(4, StoreError::from(e)))?;
    let mentions = serde_json::from_str(&mentions_json)
        .map_err(|e| conversion_error(6, StoreError::from(e)))?;
    let attachments = serde_json::from_str(&attachments_json)
        .map_err(|e| conversion_error(7, StoreError::from(e)))?;

    Ok(Message {
        id: MessageId(parse_uuid(1, &id_str)?),
        chat_id: ChatId(parse_uuid(2, &chat_id_str)?),
        sender_id: UserId(parse_uuid(3, &sender_str)?),
        sealed,
        created_at: from_millis(created_ms).map_err(|e| conversion_error(5, e))?,
        mentions,
        attachments,
        deleted_for_all,
        deleted_by: deleted_by
            .map(|s| parse_uuid(9, &s).map(UserId))
            .transpose()?,
        deleted_at: deleted_ms
            .map(|ms| from_millis(ms).map_err(|e| conversion_error(10, e)))
            .transpose()?,
        seq,
    })
}
