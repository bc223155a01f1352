//! Database Migrations
//!
//! Schema migration definitions for the storage layer. Schema evolution is
//! additive only: new tables, new nullable columns, backfills.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, relations, profiles, sessions, scheduled items",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Board projection for scheduled items (backfilled)",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Usage accounting and sub-agent runs",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'fact',
    memory_type TEXT NOT NULL DEFAULT 'regular',
    importance INTEGER NOT NULL DEFAULT 5,
    confidence REAL NOT NULL DEFAULT 0.8,
    is_latest INTEGER NOT NULL DEFAULT 1,
    source TEXT NOT NULL DEFAULT 'user',

    -- Two independent timestamps
    document_date TEXT NOT NULL,
    event_date TEXT,

    -- Decay state
    prominence REAL NOT NULL DEFAULT 1.0,
    last_accessed TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,

    -- Provenance
    learned_from TEXT NOT NULL DEFAULT 'conversation',
    times_confirmed INTEGER NOT NULL DEFAULT 0,
    contradiction_ids TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',

    -- Embedding (little-endian f32 blob)
    embedding BLOB,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_user_latest ON memories(user_id, is_latest);
CREATE INDEX IF NOT EXISTS idx_memories_prominence ON memories(prominence);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_learned_from ON memories(learned_from);

-- FTS5 mirror for keyword search
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    id,
    content,
    content='memories',
    content_rowid='rowid',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, id, content)
    VALUES (NEW.rowid, NEW.id, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE OF content ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content);
    INSERT INTO memories_fts(rowid, id, content)
    VALUES (NEW.rowid, NEW.id, NEW.content);
END;

-- Typed relation graph. Deleting a memory drops its edges, never the reverse.
CREATE TABLE IF NOT EXISTS memory_relations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    relation_type TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    UNIQUE(source_id, target_id, relation_type)
);

CREATE INDEX IF NOT EXISTS idx_relations_source ON memory_relations(source_id);
CREATE INDEX IF NOT EXISTS idx_relations_target ON memory_relations(target_id);

-- Static key/value profile
CREATE TABLE IF NOT EXISTS user_profiles (
    user_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, key)
);

-- Consolidation-maintained profile fields, scoped to the user or the agent
CREATE TABLE IF NOT EXISTS dynamic_profiles (
    user_id TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'user',
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.7,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, scope, key)
);

-- Learned preferences
CREATE TABLE IF NOT EXISTS behavioral_patterns (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    pattern TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.5,
    observed_count INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(user_id, pattern)
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_active TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    ended_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, ended_at);

CREATE TABLE IF NOT EXISTS session_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_messages_session ON session_messages(session_id);

CREATE TABLE IF NOT EXISTS session_summaries (
    id TEXT PRIMARY KEY,
    session_id TEXT REFERENCES sessions(id) ON DELETE SET NULL,
    user_id TEXT NOT NULL,
    summary TEXT NOT NULL,
    topics TEXT NOT NULL DEFAULT '[]',
    message_count INTEGER NOT NULL DEFAULT 0,
    duration_secs INTEGER NOT NULL DEFAULT 0,
    embedding BLOB,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_summaries_user_created ON session_summaries(user_id, created_at);

-- Durable queue of nudges and tasks
CREATE TABLE IF NOT EXISTS scheduled_items (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    session_id TEXT REFERENCES sessions(id) ON DELETE SET NULL,
    source TEXT NOT NULL DEFAULT 'agent',
    kind TEXT NOT NULL DEFAULT 'nudge',
    item_type TEXT NOT NULL DEFAULT 'reminder',
    message TEXT NOT NULL,
    context TEXT,
    allowed_tools TEXT NOT NULL DEFAULT '[]',
    trigger_at INTEGER,            -- epoch seconds, NULL = unscheduled
    recurrence TEXT,               -- JSON Recurrence
    status TEXT NOT NULL DEFAULT 'pending',
    source_memory_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    fired_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_scheduled_due ON scheduled_items(status, trigger_at);
CREATE INDEX IF NOT EXISTS idx_scheduled_user ON scheduled_items(user_id, status);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Board projection. Existing rows get their board status backfilled
/// from the execution status and trigger presence.
const MIGRATION_V2_UP: &str = r#"
ALTER TABLE scheduled_items ADD COLUMN board_status TEXT;
ALTER TABLE scheduled_items ADD COLUMN board_hold TEXT;
ALTER TABLE scheduled_items ADD COLUMN priority INTEGER NOT NULL DEFAULT 0;
ALTER TABLE scheduled_items ADD COLUMN labels TEXT NOT NULL DEFAULT '[]';
ALTER TABLE scheduled_items ADD COLUMN depends_on TEXT NOT NULL DEFAULT '[]';
ALTER TABLE scheduled_items ADD COLUMN goal_id TEXT;
ALTER TABLE scheduled_items ADD COLUMN result TEXT;

UPDATE scheduled_items SET board_status = CASE
    WHEN status = 'processing' THEN 'in_progress'
    WHEN status IN ('fired', 'acted') THEN 'done'
    WHEN status IN ('dismissed', 'expired') THEN 'archived'
    WHEN trigger_at IS NULL THEN 'inbox'
    ELSE 'scheduled'
END
WHERE board_status IS NULL;

CREATE INDEX IF NOT EXISTS idx_scheduled_board ON scheduled_items(user_id, board_status);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: Usage accounting hook target and sub-agent run log
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS cost_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cost_usage_user ON cost_usage(user_id, created_at);

CREATE TABLE IF NOT EXISTS subagent_runs (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    scheduled_item_id TEXT REFERENCES scheduled_items(id) ON DELETE SET NULL,
    goal TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    result TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_subagent_runs_item ON subagent_runs(scheduled_item_id);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );

            // Use execute_batch to handle multi-statement SQL including triggers
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_migrations_apply_in_order() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(get_current_version(&conn).unwrap(), 3);

        // Re-running is a no-op
        assert_eq!(apply_migrations(&conn).unwrap(), 0);
    }

    #[test]
    fn test_board_status_backfill_for_legacy_rows() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATION_V1_UP).unwrap();

        // Legacy rows written before the board columns existed
        for (id, status, trigger) in [
            ("a", "pending", None),
            ("b", "pending", Some(1_900_000_000i64)),
            ("c", "processing", Some(1_700_000_000)),
            ("d", "fired", Some(1_700_000_000)),
            ("e", "expired", Some(1_700_000_000)),
        ] {
            conn.execute(
                "INSERT INTO scheduled_items (id, user_id, message, status, trigger_at, created_at, updated_at)
                 VALUES (?1, 'u', 'm', ?2, ?3, datetime('now'), datetime('now'))",
                rusqlite::params![id, status, trigger],
            )
            .unwrap();
        }

        apply_migrations(&conn).unwrap();

        let board = |id: &str| -> String {
            conn.query_row(
                "SELECT board_status FROM scheduled_items WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(board("a"), "inbox");
        assert_eq!(board("b"), "scheduled");
        assert_eq!(board("c"), "in_progress");
        assert_eq!(board("d"), "done");
        assert_eq!(board("e"), "archived");
    }
}
