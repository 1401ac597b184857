//! v001 -- Initial schema creation.
//!
//! Creates `chats`, `messages`, `message_hidden`, `reactions` and
//! `audit_events`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Chats: one JSON document per chat
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id            TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    kind          TEXT NOT NULL,              -- 'direct' | 'group'
    direct_key    TEXT UNIQUE,                -- unordered participant pair, direct only
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    doc           TEXT NOT NULL               -- serialized Chat
);

CREATE INDEX IF NOT EXISTS idx_chats_kind_updated ON chats(kind, updated_at_ms DESC);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,  -- insertion order tie-break
    id             TEXT UNIQUE NOT NULL,               -- UUID v4
    chat_id        TEXT NOT NULL,
    sender_id      TEXT NOT NULL,
    sealed         TEXT,                               -- JSON SealedText, NULL when no text
    created_at_ms  INTEGER NOT NULL,
    mentions       TEXT NOT NULL DEFAULT '[]',         -- JSON array of user ids
    attachments    TEXT NOT NULL DEFAULT '[]',         -- JSON array of AttachmentRef
    deleted_for_all INTEGER NOT NULL DEFAULT 0,        -- boolean 0/1, monotonic
    deleted_by     TEXT,
    deleted_at_ms  INTEGER,

    FOREIGN KEY (chat_id) REFERENCES chats(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_order
    ON messages(chat_id, created_at_ms, seq);
CREATE INDEX IF NOT EXISTS idx_messages_sender_window
    ON messages(chat_id, sender_id, created_at_ms);

-- ----------------------------------------------------------------
-- Per-viewer tombstones (delete for me)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_hidden (
    message_id   TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    hidden_at_ms INTEGER NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);

-- ----------------------------------------------------------------
-- Reactions: at most one row per (message, user, emoji)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reactions (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id    TEXT NOT NULL,
    user_id       TEXT NOT NULL,
    emoji         TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,

    UNIQUE (message_id, user_id, emoji),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);

CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions(message_id, seq);

-- ----------------------------------------------------------------
-- Audit log: append-only, independent of the chat document
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS audit_events (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT UNIQUE NOT NULL,
    chat_id       TEXT NOT NULL,
    actor_id      TEXT NOT NULL,
    kind          TEXT NOT NULL,
    meta          TEXT NOT NULL,              -- JSON object
    created_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_chat ON audit_events(chat_id, seq);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
