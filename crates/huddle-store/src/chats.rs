//! Chat document CRUD.

use rusqlite::{params, OptionalExtension};

use huddle_shared::types::{ChatId, ChatKind, UserId};

use crate::database::{conversion_error, to_millis, Tx};
use crate::error::{Result, StoreError};
use crate::models::Chat;

const SELECT_DOC: &str = "SELECT doc FROM chats";

impl Tx<'_> {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert a new chat. A direct chat whose pair already exists violates
    /// the `direct_key` uniqueness constraint.
    pub fn insert_chat(&self, chat: &Chat) -> Result<()> {
        let direct_key = match chat.kind {
            ChatKind::Direct => {
                let mut members = chat.participants.iter();
                match (members.next(), members.next()) {
                    (Some(a), Some(b)) => Some(Chat::direct_key(a, b)),
                    _ => None,
                }
            }
            ChatKind::Group => None,
        };

        self.conn().execute(
            "INSERT INTO chats (id, kind, direct_key, created_at_ms, updated_at_ms, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                chat.id.to_string(),
                chat.kind.as_str(),
                direct_key,
                to_millis(&chat.created_at),
                to_millis(&chat.updated_at),
                serde_json::to_string(chat)?,
            ],
        )?;
        Ok(())
    }

    /// Overwrite the stored document. Callers load, mutate and save inside
    /// the same write transaction.
    pub fn save_chat(&self, chat: &Chat) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE chats SET updated_at_ms = ?2, doc = ?3 WHERE id = ?1",
            params![
                chat.id.to_string(),
                to_millis(&chat.updated_at),
                serde_json::to_string(chat)?,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn find_chat(&self, id: &ChatId) -> Result<Option<Chat>> {
        self.conn()
            .query_row(
                &format!("{SELECT_DOC} WHERE id = ?1"),
                params![id.to_string()],
                row_to_chat,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn find_direct_chat(&self, a: &UserId, b: &UserId) -> Result<Option<Chat>> {
        self.conn()
            .query_row(
                &format!("{SELECT_DOC} WHERE direct_key = ?1"),
                params![Chat::direct_key(a, b)],
                row_to_chat,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Chats the user can read: current and former participants.
    /// Most recently updated first.
    pub fn list_chats_for_user(&self, user: &UserId) -> Result<Vec<Chat>> {
        self.query_chats(
            &format!(
                "{SELECT_DOC}
                 WHERE EXISTS (SELECT 1 FROM json_each(chats.doc, '$.participants') WHERE value = ?1)
                    OR EXISTS (SELECT 1 FROM json_each(chats.doc, '$.removedParticipants') WHERE value = ?1)
                 ORDER BY updated_at_ms DESC"
            ),
            params![user.to_string()],
        )
    }

    /// Ids of chats where the user is a current participant.
    pub fn participating_chat_ids(&self, user: &UserId) -> Result<Vec<ChatId>> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM chats
             WHERE EXISTS (SELECT 1 FROM json_each(chats.doc, '$.participants') WHERE value = ?1)",
        )?;
        let rows = stmt.query_map(params![user.to_string()], |row| {
            let id: String = row.get(0)?;
            uuid::Uuid::parse_str(&id)
                .map(ChatId)
                .map_err(|e| conversion_error(0, StoreError::from(e)))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Every group chat, most recently updated first.
    pub fn list_group_chats(&self) -> Result<Vec<Chat>> {
        self.query_chats(
            &format!("{SELECT_DOC} WHERE kind = 'group' ORDER BY updated_at_ms DESC"),
            params![],
        )
    }

    fn query_chats(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(args, row_to_chat)?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        Ok(chats)
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let doc: String = row.get(0)?;
    serde_json::from_str(&doc).map_err(|e| conversion_error(0, StoreError::from(e)))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::Database;

    #[test]
    fn insert_and_load_chat() {
        let db = Database::open_in_memory().unwrap();
        let chat = Chat::new_group(UserId::new(), "Cardiology".into(), [UserId::new()], Utc::now());

        db.write(|tx| tx.insert_chat(&chat)).unwrap();
        let loaded = db.read(|tx| tx.find_chat(&chat.id)).unwrap();
        assert_eq!(loaded, Some(chat));

        let missing = db.read(|tx| tx.find_chat(&ChatId::new())).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn direct_pair_is_unique() {
        let db = Database::open_in_memory().unwrap();
        let a = UserId::new();
        let b = UserId::new();

        db.write(|tx| tx.insert_chat(&Chat::new_direct(a, b, Utc::now())))
            .unwrap();
        let dup = db.write(|tx| tx.insert_chat(&Chat::new_direct(b, a, Utc::now())));
        assert!(dup.is_err());

        let found = db.read(|tx| tx.find_direct_chat(&b, &a)).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn save_missing_chat_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let chat = Chat::new_direct(UserId::new(), UserId::new(), Utc::now());
        let err = db.write(|tx| tx.save_chat(&chat)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn list_includes_removed_participants() {
        let db = Database::open_in_memory().unwrap();
        let creator = UserId::new();
        let gone = UserId::new();
        let stranger = UserId::new();

        let mut chat = Chat::new_group(creator, "Pharmacy".into(), [gone], Utc::now());
        chat.participants.remove(&gone);
        chat.removed_participants.insert(gone);
        db.write(|tx| tx.insert_chat(&chat)).unwrap();

        assert_eq!(db.read(|tx| tx.list_chats_for_user(&gone)).unwrap().len(), 1);
        assert!(db.read(|tx| tx.list_chats_for_user(&stranger)).unwrap().is_empty());
        assert!(db.read(|tx| tx.participating_chat_ids(&gone)).unwrap().is_empty());
        assert_eq!(
            db.read(|tx| tx.participating_chat_ids(&creator)).unwrap(),
            vec![chat.id]
        );
    }

    #[test]
    fn listing_orders_by_last_update() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();
        let now = Utc::now();

        let older = Chat::new_direct(user, UserId::new(), now - Duration::minutes(5));
        let newer = Chat::new_group(user, "Lab".into(), [UserId::new()], now);
        db.write(|tx| {
            tx.insert_chat(&older)?;
            tx.insert_chat(&newer)
        })
        .unwrap();

        let ids: Vec<ChatId> = db
            .read(|tx| tx.list_chats_for_user(&user))
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![newer.id, older.id]);

        let groups = db.read(|tx| tx.list_group_chats()).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, newer.id);
    }
}
