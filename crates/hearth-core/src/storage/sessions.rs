//! Conversation sessions, their transcripts and end-of-session summaries

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sqlite::{micros, parse_opt_ts, parse_ts, ts, Result, Storage, StorageError};
use crate::embeddings::{embedding_from_bytes, embedding_to_bytes};

/// A conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: i64,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One transcript line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Summary written when a session ends. Reflection reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub session_id: Option<String>,
    pub user_id: String,
    pub summary: String,
    pub topics: Vec<String>,
    pub message_count: i64,
    pub duration_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn new(user_id: &str, summary: impl Into<String>, message_count: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: None,
            user_id: user_id.to_string(),
            summary: summary.into(),
            topics: Vec::new(),
            message_count,
            duration_secs: 0,
            embedding: None,
            created_at: micros(Utc::now()),
        }
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let created_at: String = row.get("created_at")?;
    let last_active: String = row.get("last_active")?;
    Ok(Session {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        created_at: parse_ts(&created_at, "created_at")?,
        last_active: parse_ts(&last_active, "last_active")?,
        message_count: row.get("message_count")?,
        ended_at: parse_opt_ts(row.get("ended_at")?, "ended_at")?,
    })
}

fn row_to_summary(row: &rusqlite::Row) -> rusqlite::Result<SessionSummary> {
    let topics: String = row.get("topics")?;
    let created_at: String = row.get("created_at")?;
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    Ok(SessionSummary {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        user_id: row.get("user_id")?,
        summary: row.get("summary")?,
        topics: serde_json::from_str(&topics).unwrap_or_default(),
        message_count: row.get("message_count")?,
        duration_secs: row.get("duration_secs")?,
        embedding: embedding.as_deref().and_then(embedding_from_bytes),
        created_at: parse_ts(&created_at, "created_at")?,
    })
}

impl Storage {
    /// The user's open session, or a new one
    pub fn get_or_create_session(&self, user_id: &str) -> Result<Session> {
        let writer = self.writer()?;
        let existing = writer
            .query_row(
                "SELECT * FROM sessions WHERE user_id = ?1 AND ended_at IS NULL
                 ORDER BY last_active DESC LIMIT 1",
                params![user_id],
                row_to_session,
            )
            .optional()?;
        if let Some(session) = existing {
            return Ok(session);
        }

        let now = micros(Utc::now());
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            last_active: now,
            message_count: 0,
            ended_at: None,
        };
        writer.execute(
            "INSERT INTO sessions (id, user_id, created_at, last_active, message_count)
             VALUES (?1, ?2, ?3, ?3, 0)",
            params![session.id, session.user_id, ts(now)],
        )?;
        tracing::debug!(user_id, session_id = %session.id, "Opened session");
        Ok(session)
    }

    /// End every open session for the user and start a fresh one
    pub fn reset_session(&self, user_id: &str) -> Result<Session> {
        {
            let writer = self.writer()?;
            writer.execute(
                "UPDATE sessions SET ended_at = ?1 WHERE user_id = ?2 AND ended_at IS NULL",
                params![ts(Utc::now()), user_id],
            )?;
        }
        self.get_or_create_session(user_id)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let reader = self.reader()?;
        let session = reader
            .query_row("SELECT * FROM sessions WHERE id = ?1", params![id], row_to_session)
            .optional()?;
        Ok(session)
    }

    pub fn append_session_message(&self, session_id: &str, role: &str, content: &str) -> Result<SessionMessage> {
        let now = micros(Utc::now());
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let touched = tx.execute(
            "UPDATE sessions SET last_active = ?1, message_count = message_count + 1
             WHERE id = ?2",
            params![ts(now), session_id],
        )?;
        if touched == 0 {
            return Err(StorageError::NotFound(format!("session {}", session_id)));
        }

        tx.execute(
            "INSERT INTO session_messages (session_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role, content, ts(now)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(SessionMessage {
            id,
            session_id: session_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: now,
        })
    }

    pub fn session_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, session_id, role, content, created_at FROM session_messages
             WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let created_at: String = row.get(4)?;
            Ok(SessionMessage {
                id: row.get(0)?,
                session_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                created_at: parse_ts(&created_at, "created_at")?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn save_session_summary(&self, summary: &SessionSummary) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO session_summaries
                (id, session_id, user_id, summary, topics, message_count, duration_secs, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                summary.id,
                summary.session_id,
                summary.user_id,
                summary.summary,
                serde_json::to_string(&summary.topics)?,
                summary.message_count,
                summary.duration_secs,
                summary.embedding.as_deref().map(embedding_to_bytes),
                ts(summary.created_at),
            ],
        )?;
        Ok(())
    }

    /// Summaries newer than `since` with at least `min_messages` messages, newest first
    pub fn recent_session_summaries(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        min_messages: i64,
    ) -> Result<Vec<SessionSummary>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM session_summaries
             WHERE user_id = ?1 AND created_at >= ?2 AND message_count >= ?3
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id, ts(since), min_messages], row_to_summary)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Delete ended sessions idle since before `older_than`. Scheduled items
    /// and summaries that referenced them lose the link but survive.
    pub fn prune_sessions(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let cutoff = ts(older_than);

        tx.execute(
            "UPDATE scheduled_items SET session_id = NULL
             WHERE session_id IN (SELECT id FROM sessions WHERE ended_at IS NOT NULL AND last_active < ?1)",
            params![cutoff],
        )?;
        tx.execute(
            "UPDATE session_summaries SET session_id = NULL
             WHERE session_id IN (SELECT id FROM sessions WHERE ended_at IS NOT NULL AND last_active < ?1)",
            params![cutoff],
        )?;
        let deleted = tx.execute(
            "DELETE FROM sessions WHERE ended_at IS NOT NULL AND last_active < ?1",
            params![cutoff],
        )?;
        tx.commit()?;

        if deleted > 0 {
            tracing::info!(deleted, "Pruned stale sessions");
        }
        Ok(deleted)
    }

    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        tx.execute(
            "UPDATE scheduled_items SET session_id = NULL WHERE session_id = ?1",
            params![id],
        )?;
        tx.execute(
            "UPDATE session_summaries SET session_id = NULL WHERE session_id = ?1",
            params![id],
        )?;
        let deleted = tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Retention cutoff helper for the gardener
    pub fn session_cutoff(now: DateTime<Utc>, retention_days: i64) -> DateTime<Utc> {
        now - Duration::days(retention_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::NewScheduledItem;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(Some(dir.path().join("test.db"))).unwrap();
        (storage, dir)
    }

    #[test]
    fn test_get_or_create_reuses_open_session() {
        let (storage, _dir) = create_test_storage();
        let first = storage.get_or_create_session("u").unwrap();
        let again = storage.get_or_create_session("u").unwrap();
        assert_eq!(first.id, again.id);

        let fresh = storage.reset_session("u").unwrap();
        assert_ne!(fresh.id, first.id);
        let ended = storage.get_session(&first.id).unwrap().unwrap();
        assert!(ended.ended_at.is_some());
    }

    #[test]
    fn test_returned_rows_match_stored_timestamps() {
        let (storage, _dir) = create_test_storage();
        let session = storage.get_or_create_session("u").unwrap();
        let stored = storage.get_session(&session.id).unwrap().unwrap();
        assert_eq!(stored.created_at, session.created_at);

        let message = storage.append_session_message(&session.id, "user", "hi").unwrap();
        assert_eq!(storage.session_messages(&session.id).unwrap()[0].created_at, message.created_at);

        let summary = SessionSummary::new("u", "short chat", 4);
        storage.save_session_summary(&summary).unwrap();
        let saved = storage
            .recent_session_summaries("u", summary.created_at, 0)
            .unwrap();
        assert_eq!(saved[0].created_at, summary.created_at);
    }

    #[test]
    fn test_append_message_updates_counters() {
        let (storage, _dir) = create_test_storage();
        let session = storage.get_or_create_session("u").unwrap();
        storage.append_session_message(&session.id, "user", "hello").unwrap();
        storage.append_session_message(&session.id, "assistant", "hi there").unwrap();

        let messages = storage.session_messages(&session.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(storage.get_session(&session.id).unwrap().unwrap().message_count, 2);

        let missing = storage.append_session_message("nope", "user", "x");
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_recent_summaries_filter_by_size_and_age() {
        let (storage, _dir) = create_test_storage();
        let now = Utc::now();

        let mut old = SessionSummary::new("u", "old chat", 10);
        old.created_at = now - Duration::hours(30);
        storage.save_session_summary(&old).unwrap();

        let short = SessionSummary::new("u", "quick hello", 1);
        storage.save_session_summary(&short).unwrap();

        let mut real = SessionSummary::new("u", "planned the week", 8);
        real.topics = vec!["planning".into()];
        storage.save_session_summary(&real).unwrap();

        let recent = storage
            .recent_session_summaries("u", now - Duration::hours(24), 3)
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].summary, "planned the week");
        assert_eq!(recent[0].topics, vec!["planning".to_string()]);
    }

    #[test]
    fn test_delete_session_keeps_scheduled_items() {
        let (storage, _dir) = create_test_storage();
        let session = storage.get_or_create_session("u").unwrap();
        let item = storage
            .insert_scheduled_item(NewScheduledItem::nudge("u", "stretch", Some(1)).with_session(&session.id))
            .unwrap();
        assert_eq!(item.session_id.as_deref(), Some(session.id.as_str()));

        assert!(storage.delete_session(&session.id).unwrap());
        let kept = storage.get_scheduled_item(&item.id).unwrap().unwrap();
        assert_eq!(kept.session_id, None);
    }

    #[test]
    fn test_prune_sessions_by_idle_time() {
        let (storage, _dir) = create_test_storage();
        let session = storage.get_or_create_session("u").unwrap();

        // Open sessions are never pruned
        assert_eq!(storage.prune_sessions(Utc::now() + Duration::seconds(5)).unwrap(), 0);
        let open = storage.reset_session("u").unwrap();

        let pruned = storage
            .prune_sessions(Storage::session_cutoff(Utc::now(), 30))
            .unwrap();
        assert_eq!(pruned, 0);

        let pruned = storage
            .prune_sessions(Utc::now() + Duration::seconds(5))
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(storage.get_session(&session.id).unwrap().is_none());
        assert!(storage.get_session(&open.id).unwrap().is_some());
    }
}
