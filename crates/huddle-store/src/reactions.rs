//! Row-level reactions.
//!
//! Each `(message, user, emoji)` triple is its own row, so two users reacting
//! to the same message at the same time never overwrite each other.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::params;

use huddle_shared::protocol::ReactionGroup;
use huddle_shared::types::{ChatId, MessageId, UserId};

use crate::database::{conversion_error, to_millis, Tx};
use crate::error::{Result, StoreError};

impl Tx<'_> {
    /// Flip the presence of one reaction. Returns `true` if it was added.
    pub fn toggle_reaction(
        &self,
        message: &MessageId,
        user: &UserId,
        emoji: &str,
        at: &DateTime<Utc>,
    ) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
            params![message.to_string(), user.to_string(), emoji],
        )?;
        if removed > 0 {
            return Ok(false);
        }

        self.conn().execute(
            "INSERT INTO reactions (message_id, user_id, emoji, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![message.to_string(), user.to_string(), emoji, to_millis(at)],
        )?;
        Ok(true)
    }

    /// Reactions on one message, grouped by emoji in order of first use.
    pub fn reaction_groups(&self, message: &MessageId) -> Result<Vec<ReactionGroup>> {
        let mut stmt = self.conn().prepare(
            "SELECT emoji, user_id FROM reactions WHERE message_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![message.to_string()], |row| {
            let emoji: String = row.get(0)?;
            let user: String = row.get(1)?;
            Ok((emoji, user))
        })?;

        let mut groups = Vec::new();
        for row in rows {
            let (emoji, user) = row?;
            push_reaction(&mut groups, emoji, parse_user(&user)?);
        }
        Ok(groups)
    }

    /// Reactions for every message of a chat, keyed by message.
    pub fn reaction_groups_for_chat(
        &self,
        chat_id: &ChatId,
    ) -> Result<HashMap<MessageId, Vec<ReactionGroup>>> {
        let mut stmt = self.conn().prepare(
            "SELECT r.message_id, r.emoji, r.user_id
             FROM reactions r
             JOIN messages m ON m.id = r.message_id
             WHERE m.chat_id = ?1
             ORDER BY r.seq ASC",
        )?;
        let rows = stmt.query_map(params![chat_id.to_string()], |row| {
            let message: String = row.get(0)?;
            let emoji: String = row.get(1)?;
            let user: String = row.get(2)?;
            Ok((message, emoji, user))
        })?;

        let mut by_message: HashMap<MessageId, Vec<ReactionGroup>> = HashMap::new();
        for row in rows {
            let (message, emoji, user) = row?;
            let message = message
                .parse::<uuid::Uuid>()
                .map(MessageId)
                .map_err(|e| conversion_error(0, StoreError::from(e)))?;
            push_reaction(by_message.entry(message).or_default(), emoji, parse_user(&user)?);
        }
        Ok(by_message)
    }
}

fn parse_user(s: &str) -> Result<UserId> {
    Ok(UserId(uuid::Uuid::parse_str(s)?))
}

fn push_reaction(groups: &mut Vec<ReactionGroup>, emoji: String, user: UserId) {
    match groups.iter_mut().find(|g| g.emoji == emoji) {
        Some(group) => group.user_ids.push(user),
        None => groups.push(ReactionGroup {
            emoji,
            user_ids: vec![user],
        }),
    }
}
