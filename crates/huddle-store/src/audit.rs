//! Append-only moderation log.

use rusqlite::params;

use huddle_shared::types::{AuditEventId, ChatId, UserId};

use crate::database::{conversion_error, from_millis, to_millis, Tx};
use crate::error::{Result, StoreError};
use crate::models::{AuditEvent, AuditKind};

impl Tx<'_> {
    pub fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        self.conn().execute(
            "INSERT INTO audit_events (id, chat_id, actor_id, kind, meta, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.to_string(),
                event.chat_id.to_string(),
                event.actor_id.to_string(),
                event.kind.as_str(),
                serde_json::to_string(&event.meta)?,
                to_millis(&event.created_at),
            ],
        )?;
        Ok(())
    }

    /// Every audit event of a chat, oldest first.
    pub fn list_audit(&self, chat_id: &ChatId) -> Result<Vec<AuditEvent>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, chat_id, actor_id, kind, meta, created_at_ms
             FROM audit_events WHERE chat_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![chat_id.to_string()], row_to_audit)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
    let id: String = row.get(0)?;
    let chat_id: String = row.get(1)?;
    let actor_id: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let meta: String = row.get(4)?;
    let created_ms: i64 = row.get(5)?;

    let uuid = |idx: usize, s: &str| {
        uuid::Uuid::parse_str(s).map_err(|e| conversion_error(idx, StoreError::from(e)))
    };
    let kind: AuditKind = serde_json::from_value(serde_json::Value::String(kind))
        .map_err(|e| conversion_error(3, StoreError::from(e)))?;

    Ok(AuditEvent {
        id: AuditEventId(uuid(0, &id)?),
        chat_id: ChatId(uuid(1, &chat_id)?),
        actor_id: UserId(uuid(2, &actor_id)?),
        kind,
        meta: serde_json::from_str(&meta).map_err(|e| conversion_error(4, StoreError::from(e)))?,
        created_at: from_millis(created_ms).map_err(|e| conversion_error(5, e))?,
    })
}
