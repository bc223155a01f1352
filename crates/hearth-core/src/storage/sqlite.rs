//! SQLite Storage Implementation
//!
//! Memory rows, keyword search, brute-force vector similarity, decay passes.
//! Relations, profiles, sessions, scheduled items and usage live in sibling
//! modules as further `impl Storage` blocks.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::decay::{reinforcement, DecayEngine, DecayReport};
use crate::embeddings::{cosine_similarity, embedding_from_bytes, embedding_to_bytes};
use crate::memory::{
    LearnedFrom, MemoryCategory, MemoryEntry, MemoryFilter, MemorySource, MemoryStats, MemoryType,
    NewMemory,
};
use crate::text::{normalize_words, sanitize_fts5_query};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Requested change is not allowed from the row's current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
    /// JSON column could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// Fixed-width RFC3339 so stored timestamps compare correctly as text
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Truncate to the precision `ts` stores, so returned rows equal re-read ones
pub(crate) fn micros(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.trunc_subsecs(6)
}

/// Parse RFC3339 timestamp
pub(crate) fn parse_ts(value: &str, field_name: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid {} timestamp '{}': {}", field_name, value, e),
                )),
            )
        })
}

pub(crate) fn parse_opt_ts(
    value: Option<String>,
    field_name: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(&v, field_name)).transpose()
}

// ============================================================================
// STORAGE
// ============================================================================

/// Main storage struct
///
/// Uses separate reader/writer connections for interior mutability.
/// All methods take `&self`, making Storage `Send + Sync` so the gardener,
/// the scheduler loop and the request path can share one `Arc<Storage>`.
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
}

impl Storage {
    /// Apply PRAGMAs and optional encryption to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        // Apply encryption key if SQLCipher is enabled and key is provided
        #[cfg(feature = "encryption")]
        {
            if let Ok(key) = std::env::var("HEARTH_ENCRYPTION_KEY") {
                if !key.is_empty() {
                    conn.pragma_update(None, "key", &key)?;
                }
            }
        }

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA journal_size_limit = 67108864;",
        )?;

        Ok(())
    }

    /// Open (or create) the store. `None` uses the platform data directory.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("com", "hearth", "core").ok_or_else(|| {
                    StorageError::Init("Could not determine project directories".to_string())
                })?;
                proj_dirs.data_dir().join("hearth.db")
            }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
            // Restrict directory permissions to owner-only on Unix
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o700);
                let _ = std::fs::set_permissions(parent, perms);
            }
        }

        let writer_conn = Connection::open(&path)?;

        // Restrict database file permissions to owner-only on Unix
        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        Self::configure_connection(&writer_conn)?;

        // Apply migrations on writer only
        let applied = super::migrations::apply_migrations(&writer_conn)?;
        if applied > 0 {
            tracing::info!(path = %path.display(), applied, "Database migrated");
        }

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            path,
        })
    }

    /// Database file path
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub(crate) fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StorageError::Init("Writer lock poisoned".into()))
    }

    pub(crate) fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StorageError::Init("Reader lock poisoned".into()))
    }

    // ========================================================================
    // MEMORIES
    // ========================================================================

    /// Store a new memory
    pub fn insert_memory(&self, input: NewMemory) -> Result<MemoryEntry> {
        self.insert_memory_at(input, Utc::now())
    }

    /// Store a new memory with an explicit creation time
    pub fn insert_memory_at(&self, input: NewMemory, at: DateTime<Utc>) -> Result<MemoryEntry> {
        let mut entry = MemoryEntry::from_new(input, micros(at));
        entry.event_date = entry.event_date.map(micros);
        let metadata = serde_json::to_string(&entry.metadata)?;
        let contradictions = serde_json::to_string(&entry.contradiction_ids)?;
        let embedding = entry.embedding.as_deref().map(embedding_to_bytes);

        {
            let writer = self.writer()?;
            writer.execute(
                "INSERT INTO memories (
                    id, user_id, content, category, memory_type, importance, confidence,
                    is_latest, source, document_date, event_date, prominence, last_accessed,
                    access_count, learned_from, times_confirmed, contradiction_ids, metadata,
                    embedding, created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                    ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18,
                    ?19, ?20, ?21
                )",
                params![
                    entry.id,
                    entry.user_id,
                    entry.content,
                    entry.category.as_str(),
                    entry.memory_type.as_str(),
                    entry.importance as i64,
                    entry.confidence,
                    entry.is_latest,
                    entry.source.as_str(),
                    ts(entry.document_date),
                    entry.event_date.map(ts),
                    entry.prominence,
                    entry.last_accessed.map(ts),
                    entry.access_count,
                    entry.learned_from.as_str(),
                    entry.times_confirmed,
                    contradictions,
                    metadata,
                    embedding,
                    ts(entry.created_at),
                    ts(entry.updated_at),
                ],
            )?;
        }

        tracing::debug!(
            memory_id = %entry.id,
            user_id = %entry.user_id,
            category = %entry.category,
            importance = entry.importance,
            "Memory stored"
        );
        Ok(entry)
    }

    /// Get a memory by ID
    pub fn get_memory(&self, id: &str) -> Result<Option<MemoryEntry>> {
        let reader = self.reader()?;
        let entry = reader
            .query_row("SELECT * FROM memories WHERE id = ?1", params![id], |row| {
                Self::row_to_memory(row)
            })
            .optional()?;
        Ok(entry)
    }

    /// Convert a row to MemoryEntry
    pub(crate) fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<MemoryEntry> {
        let contradictions: String = row.get("contradiction_ids")?;
        let metadata: String = row.get("metadata")?;
        let embedding: Option<Vec<u8>> = row.get("embedding")?;
        let importance: i64 = row.get("importance")?;

        let category: String = row.get("category")?;
        let memory_type: String = row.get("memory_type")?;
        let source: String = row.get("source")?;
        let learned_from: String = row.get("learned_from")?;

        let document_date: String = row.get("document_date")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(MemoryEntry {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            content: row.get("content")?,
            category: MemoryCategory::parse_name(&category),
            memory_type: MemoryType::parse_name(&memory_type),
            importance: importance.clamp(1, 10) as u8,
            confidence: row.get("confidence")?,
            is_latest: row.get("is_latest")?,
            source: MemorySource::parse_name(&source),
            document_date: parse_ts(&document_date, "document_date")?,
            event_date: parse_opt_ts(row.get("event_date")?, "event_date")?,
            created_at: parse_ts(&created_at, "created_at")?,
            updated_at: parse_ts(&updated_at, "updated_at")?,
            prominence: row.get("prominence")?,
            last_accessed: parse_opt_ts(row.get("last_accessed")?, "last_accessed")?,
            access_count: row.get("access_count")?,
            learned_from: LearnedFrom::parse_name(&learned_from),
            times_confirmed: row.get("times_confirmed")?,
            contradiction_ids: serde_json::from_str(&contradictions).unwrap_or_default(),
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            embedding: embedding.and_then(|b| embedding_from_bytes(&b)),
        })
    }

    /// List a user's memories, most prominent first
    pub fn list_memories(&self, user_id: &str, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories
             WHERE user_id = ?1
               AND (?2 IS NULL OR category = ?2)
               AND (?3 IS NULL OR learned_from = ?3)
               AND (?4 OR is_latest = 1)
             ORDER BY prominence DESC, created_at DESC
             LIMIT ?5",
        )?;

        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            params![
                user_id,
                filter.category.map(|c| c.as_str()),
                filter.learned_from.map(|l| l.as_str()),
                filter.include_superseded,
                limit,
            ],
            Self::row_to_memory,
        )?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// The user's latest memories, newest first
    pub fn recent_memories(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories
             WHERE user_id = ?1 AND is_latest = 1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], Self::row_to_memory)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Memories whose embedding is most similar to `query`, best first.
    ///
    /// Brute-force cosine over the user's embedded rows.
    pub fn similar_memories(
        &self,
        user_id: &str,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
        include_superseded: bool,
    ) -> Result<Vec<(MemoryEntry, f32)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories
             WHERE user_id = ?1 AND embedding IS NOT NULL AND (?2 OR is_latest = 1)",
        )?;
        let rows = stmt.query_map(params![user_id, include_superseded], Self::row_to_memory)?;

        let mut scored = Vec::new();
        for row in rows {
            let entry = row?;
            let Some(vector) = entry.embedding.as_deref() else {
                continue;
            };
            let similarity = cosine_similarity(query, vector);
            if similarity >= min_similarity {
                scored.push((entry, similarity));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Keyword search over memory content (FTS5, BM25 ranked)
    pub fn search_memories(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        include_superseded: bool,
    ) -> Result<Vec<MemoryEntry>> {
        if normalize_words(query).is_empty() {
            return Ok(Vec::new());
        }
        let sanitized_query = sanitize_fts5_query(query);

        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT m.* FROM memories m
             JOIN memories_fts fts ON m.rowid = fts.rowid
             WHERE memories_fts MATCH ?1
               AND m.user_id = ?2
               AND (?3 OR m.is_latest = 1)
             ORDER BY bm25(memories_fts)
             LIMIT ?4",
        )?;

        let rows = stmt.query_map(
            params![sanitized_query, user_id, include_superseded, limit as i64],
            Self::row_to_memory,
        )?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Latest memories still missing an embedding
    pub fn memories_without_embedding(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories
             WHERE user_id = ?1 AND embedding IS NULL AND is_latest = 1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], Self::row_to_memory)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Attach an embedding to a memory
    pub fn set_embedding(&self, id: &str, embedding: &[f32]) -> Result<bool> {
        let writer = self.writer()?;
        let rows = writer.execute(
            "UPDATE memories SET embedding = ?1 WHERE id = ?2",
            params![embedding_to_bytes(embedding), id],
        )?;
        Ok(rows > 0)
    }

    /// Record a read: bumps last access and access count, nothing else
    pub fn touch_memory(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let writer = self.writer()?;
        let rows = writer.execute(
            "UPDATE memories SET last_accessed = ?1, access_count = access_count + 1
             WHERE id = ?2",
            params![ts(now), id],
        )?;
        Ok(rows > 0)
    }

    /// A re-stated fact: confidence and prominence move toward 1.0 and the
    /// confirmation counter increments. `updated_at` is left alone.
    pub fn reinforce_memory(&self, id: &str, now: DateTime<Utc>) -> Result<Option<MemoryEntry>> {
        let (confidence, prominence) = {
            let mut writer = self.writer()?;
            let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<(f64, f64)> = tx
                .query_row(
                    "SELECT confidence, prominence FROM memories WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((confidence, prominence)) = current else {
                return Ok(None);
            };
            let (confidence, prominence) = reinforcement(confidence, prominence);
            tx.execute(
                "UPDATE memories
                 SET confidence = ?1, prominence = ?2,
                     times_confirmed = times_confirmed + 1,
                     last_accessed = ?3, access_count = access_count + 1
                 WHERE id = ?4",
                params![confidence, prominence, ts(now), id],
            )?;
            tx.commit()?;
            (confidence, prominence)
        };

        tracing::debug!(memory_id = %id, confidence, prominence, "Memory reinforced");
        self.get_memory(id)
    }

    /// Mark a memory superseded. The row is kept for audit and fallback search.
    pub fn supersede_memory(&self, id: &str) -> Result<bool> {
        let writer = self.writer()?;
        let rows = writer.execute(
            "UPDATE memories SET is_latest = 0, memory_type = 'superseded' WHERE id = ?1",
            params![id],
        )?;
        Ok(rows > 0)
    }

    /// Hard-delete a memory (explicit forget or prune). Pending scheduled
    /// items that reference it by id, or whose text duplicates its content,
    /// are expired in the same transaction.
    pub fn delete_memory(&self, id: &str) -> Result<bool> {
        let Some(entry) = self.get_memory(id)? else {
            return Ok(false);
        };

        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let deleted = tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        let expired = super::scheduled::expire_items_for_memory(&tx, &entry)?;
        tx.commit()?;

        if expired > 0 {
            tracing::info!(memory_id = %id, expired, "Expired scheduled items for deleted memory");
        }
        Ok(deleted > 0)
    }

    /// Per-user statistics
    pub fn memory_stats(&self, user_id: &str) -> Result<MemoryStats> {
        let reader = self.reader()?;

        let (total, latest, with_embedding, average_prominence): (i64, i64, i64, f64) = reader
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(is_latest), 0),
                        COALESCE(SUM(embedding IS NOT NULL), 0),
                        COALESCE(AVG(prominence), 0.0)
                 FROM memories WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let mut by_category = std::collections::BTreeMap::new();
        {
            let mut stmt = reader.prepare(
                "SELECT category, COUNT(*) FROM memories
                 WHERE user_id = ?1 AND is_latest = 1 GROUP BY category",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (category, count) = row?;
                by_category.insert(category, count);
            }
        }

        let relations: i64 = reader.query_row(
            "SELECT COUNT(*) FROM memory_relations r
             JOIN memories m ON m.id = r.source_id
             WHERE m.user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;

        Ok(MemoryStats {
            total,
            latest,
            superseded: total - latest,
            with_embedding,
            average_prominence,
            by_category,
            relations,
        })
    }

    /// Every user with at least one memory, scheduled item, session or
    /// session summary
    pub fn list_users(&self) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT user_id FROM memories
             UNION SELECT user_id FROM scheduled_items
             UNION SELECT user_id FROM sessions
             UNION SELECT user_id FROM session_summaries
             ORDER BY user_id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Count a user's memories created since a given timestamp
    pub fn count_memories_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<i64> {
        let reader = self.reader()?;
        let count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM memories WHERE user_id = ?1 AND created_at >= ?2",
            params![user_id, ts(since)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // DECAY
    // ========================================================================

    /// Recompute prominence for every non-static memory in id-ordered
    /// batches. Latest memories may be archived; archived and superseded
    /// ones keep fading so the prune sweep eventually reaches them.
    ///
    /// Only `prominence`, `is_latest` and `memory_type` are written.
    pub fn apply_decay(&self, engine: &DecayEngine, now: DateTime<Utc>) -> Result<DecayReport> {
        let batch_size = engine.config().batch_size.max(1) as i64;
        let mut report = DecayReport::default();
        let mut last_id = String::new();

        loop {
            // Read batch using reader
            let mut batch: Vec<MemoryEntry> = {
                let reader = self.reader()?;
                let mut stmt = reader.prepare(
                    "SELECT * FROM memories
                     WHERE memory_type != 'static_profile' AND id > ?1
                     ORDER BY id
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![last_id, batch_size], Self::row_to_memory)?;
                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row?);
                }
                entries
            };

            let Some(last) = batch.last() else {
                break;
            };
            last_id = last.id.clone();

            let before: Vec<(f64, bool)> = batch.iter().map(|e| (e.prominence, e.is_latest)).collect();
            report.merge(engine.recompute_prominence(&mut batch, now));
            report.updated += engine.fade_archived(&mut batch, now);

            // Write batch using writer transaction
            {
                let mut writer = self.writer()?;
                let tx = writer.transaction()?;
                for (entry, (old_prominence, was_latest)) in batch.iter().zip(before) {
                    if entry.prominence < old_prominence || entry.is_latest != was_latest {
                        tx.execute(
                            "UPDATE memories SET prominence = ?1, is_latest = ?2, memory_type = ?3
                             WHERE id = ?4",
                            params![
                                entry.prominence,
                                entry.is_latest,
                                entry.memory_type.as_str(),
                                entry.id
                            ],
                        )?;
                    }
                }
                tx.commit()?;
            }
        }

        tracing::debug!(updated = report.updated, archived = report.archived, "Decay applied");
        Ok(report)
    }

    /// Physically delete archived memories whose prominence faded below the
    /// prune threshold. Returns how many were removed.
    pub fn prune_decayed(&self, engine: &DecayEngine, now: DateTime<Utc>) -> Result<usize> {
        let candidates: Vec<String> = {
            let reader = self.reader()?;
            let mut stmt = reader.prepare(
                "SELECT id FROM memories
                 WHERE (is_latest = 0 OR memory_type = 'superseded')
                   AND prominence < ?1
                   AND created_at < ?2",
            )?;
            let rows = stmt.query_map(
                params![engine.config().prune_threshold, ts(engine.prune_cutoff(now))],
                |row| row.get(0),
            )?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut pruned = 0;
        for id in &candidates {
            if self.delete_memory(id)? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            tracing::info!(pruned, "Pruned decayed memories");
        }
        Ok(pruned)
    }
}

// ============================================================================
// TESTS
// ============================================================================
