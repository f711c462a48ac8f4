//! v001 -- Initial schema creation.
//!
//! Creates the core collections: `conversations` (plus the `participants`
//! membership table), `messages` (plus `read_receipts`), `notifications`,
//! and `presence`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    kind            TEXT NOT NULL,               -- direct-admin | direct-mixed | group
    name            TEXT,
    description     TEXT,
    created_by_id   TEXT NOT NULL,
    created_by_kind TEXT NOT NULL,               -- admin | user
    created_by_name TEXT NOT NULL,
    last_message    TEXT,                        -- JSON summary cache
    is_active       INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL,               -- ISO-8601 / RFC-3339
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated
    ON conversations(updated_at DESC);

-- ----------------------------------------------------------------
-- Participants
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS participants (
    conversation_id TEXT NOT NULL,               -- FK -> conversations(id)
    user_id         TEXT NOT NULL,
    user_kind       TEXT NOT NULL,
    name            TEXT NOT NULL,
    email           TEXT,
    profile         TEXT,
    joined_at       TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id, user_kind),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user
    ON participants(user_id, user_kind);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    conversation_id TEXT NOT NULL,               -- FK -> conversations(id)
    sender_id       TEXT NOT NULL,
    sender_kind     TEXT NOT NULL,
    sender_name     TEXT NOT NULL,
    sender_email    TEXT,
    sender_profile  TEXT,
    body            TEXT NOT NULL,
    kind            TEXT NOT NULL DEFAULT 'text',-- text | image | file | system
    attachments     TEXT NOT NULL DEFAULT '[]',  -- JSON array
    reply_to        TEXT,                        -- JSON
    is_edited       INTEGER NOT NULL DEFAULT 0,
    edited_at       TEXT,
    is_deleted      INTEGER NOT NULL DEFAULT 0,
    deleted_at      TEXT,
    created_at      TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
    ON messages(conversation_id, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_messages_sender
    ON messages(sender_id, sender_kind);

-- ----------------------------------------------------------------
-- Read receipts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS read_receipts (
    message_id TEXT NOT NULL,                    -- FK -> messages(id)
    user_id    TEXT NOT NULL,
    user_kind  TEXT NOT NULL,
    user_name  TEXT NOT NULL,
    read_at    TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id, user_kind),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Notifications
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS notifications (
    id                TEXT PRIMARY KEY NOT NULL, -- UUID v4
    user_id           TEXT NOT NULL,
    user_kind         TEXT NOT NULL,
    kind              TEXT NOT NULL,             -- new_message | new_conversation
    conversation_id   TEXT NOT NULL,
    message_id        TEXT,
    is_read           INTEGER NOT NULL DEFAULT 0,
    delivered_at      TEXT,
    read_at           TEXT,
    sender_name       TEXT NOT NULL,
    excerpt           TEXT NOT NULL,
    conversation_name TEXT,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notifications_user_unread
    ON notifications(user_id, user_kind, is_read);

CREATE INDEX IF NOT EXISTS idx_notifications_conversation
    ON notifications(conversation_id, is_read);

-- ----------------------------------------------------------------
-- Presence
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS presence (
    user_id       TEXT NOT NULL,
    user_kind     TEXT NOT NULL,
    is_online     INTEGER NOT NULL DEFAULT 0,
    connection_id TEXT,
    last_seen     TEXT NOT NULL,

    PRIMARY KEY (user_id, user_kind)
);
"#;

/// Apply the migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
