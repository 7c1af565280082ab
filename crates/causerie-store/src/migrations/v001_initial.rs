//! v001 -- Initial schema creation.
//!
//! Creates the seven core tables: `user_cache`, `conversations`,
//! `participants`, `messages`, `messaging_rules`, `contact_requests` and
//! `blocked_users`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- User cache (denormalized view synced from the identity provider;
-- never authoritative for auth)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_cache (
    id            TEXT PRIMARY KEY NOT NULL,  -- provider-issued user id
    email         TEXT,
    first_name    TEXT,
    last_name     TEXT,
    avatar_url    TEXT,
    tenant_id     TEXT,
    tenant_role   TEXT,
    platform_role TEXT,
    synced_at     TEXT NOT NULL               -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY NOT NULL,    -- UUID v4
    kind        TEXT NOT NULL,                -- DIRECT|GROUP|SUPPORT|ANNOUNCEMENT
    name        TEXT,
    description TEXT,
    avatar_url  TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL                 -- advanced on every send
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated
    ON conversations(updated_at DESC);

-- ----------------------------------------------------------------
-- Participants
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS participants (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    tenant_id       TEXT,
    role            TEXT NOT NULL,            -- OWNER|ADMIN|MEMBER
    joined_at       TEXT NOT NULL,
    last_read_at    TEXT,                     -- read watermark

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    content         TEXT NOT NULL,
    kind            TEXT NOT NULL,            -- TEXT|SYSTEM|ATTACHMENT
    attachment_url  TEXT,
    attachment_type TEXT,
    attachment_name TEXT,
    reply_to_id     TEXT,
    created_at      TEXT NOT NULL,
    edited_at       TEXT,
    deleted_at      TEXT,                     -- tombstone

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at DESC);

-- ----------------------------------------------------------------
-- Messaging rules
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messaging_rules (
    id                   TEXT PRIMARY KEY NOT NULL,
    name                 TEXT NOT NULL,
    source_scope         TEXT NOT NULL,       -- tenant|platform
    source_roles         TEXT NOT NULL,       -- comma-separated
    target_scope         TEXT NOT NULL,
    target_roles         TEXT NOT NULL,
    require_approval     INTEGER NOT NULL DEFAULT 0,
    max_messages_per_day INTEGER,
    is_active            INTEGER NOT NULL DEFAULT 1,
    priority             INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Contact requests
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contact_requests (
    id             TEXT PRIMARY KEY NOT NULL,
    from_user_id   TEXT NOT NULL,
    from_tenant_id TEXT,
    to_user_id     TEXT NOT NULL,
    to_tenant_id   TEXT,
    rule_id        TEXT NOT NULL,
    message        TEXT,
    status         TEXT NOT NULL,             -- PENDING|ACCEPTED|DECLINED|EXPIRED
    created_at     TEXT NOT NULL,
    responded_at   TEXT,
    expires_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contact_requests_to
    ON contact_requests(to_user_id, status);
CREATE INDEX IF NOT EXISTS idx_contact_requests_from
    ON contact_requests(from_user_id, status);

-- ----------------------------------------------------------------
-- Blocked users (asymmetric row, symmetric effect)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocked_users (
    user_id         TEXT NOT NULL,
    blocked_user_id TEXT NOT NULL,
    reason          TEXT,
    created_at      TEXT NOT NULL,

    PRIMARY KEY (user_id, blocked_user_id)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
