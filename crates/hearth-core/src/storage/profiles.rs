//! Static profiles, dynamic profiles and learned behavioral patterns

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sqlite::{parse_ts, ts, Result, Storage};

/// Who a dynamic profile field describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileScope {
    User,
    Agent,
}

impl ProfileScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileScope::User => "user",
            ProfileScope::Agent => "agent",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "agent" => ProfileScope::Agent,
            _ => ProfileScope::User,
        }
    }
}

/// A profile key/value. Static entries have no scope and full confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileEntry {
    pub scope: Option<ProfileScope>,
    pub key: String,
    pub value: String,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

/// A learned preference about how the user likes to be treated
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehavioralPattern {
    pub id: String,
    pub user_id: String,
    pub pattern: String,
    pub confidence: f64,
    pub observed_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn row_to_pattern(row: &rusqlite::Row) -> rusqlite::Result<BehavioralPattern> {
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(BehavioralPattern {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        pattern: row.get("pattern")?,
        confidence: row.get("confidence")?,
        observed_count: row.get("observed_count")?,
        created_at: parse_ts(&created_at, "created_at")?,
        updated_at: parse_ts(&updated_at, "updated_at")?,
    })
}

impl Storage {
    // ========================================================================
    // STATIC PROFILE
    // ========================================================================

    pub fn set_profile(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO user_profiles (user_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value,
                                                      updated_at = excluded.updated_at",
            params![user_id, key, value, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, user_id: &str, key: &str) -> Result<Option<String>> {
        let reader = self.reader()?;
        let value = reader
            .query_row(
                "SELECT value FROM user_profiles WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn list_profile(&self, user_id: &str) -> Result<Vec<ProfileEntry>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT key, value, updated_at FROM user_profiles WHERE user_id = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let updated_at: String = row.get(2)?;
            Ok(ProfileEntry {
                scope: None,
                key: row.get(0)?,
                value: row.get(1)?,
                confidence: 1.0,
                updated_at: parse_ts(&updated_at, "updated_at")?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ========================================================================
    // DYNAMIC PROFILE
    // ========================================================================

    /// Insert or replace a consolidation-maintained profile field
    pub fn upsert_dynamic_profile(
        &self,
        user_id: &str,
        scope: ProfileScope,
        key: &str,
        value: &str,
        confidence: f64,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO dynamic_profiles (user_id, scope, key, value, confidence, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, scope, key) DO UPDATE SET value = excluded.value,
                                                             confidence = excluded.confidence,
                                                             updated_at = excluded.updated_at",
            params![
                user_id,
                scope.as_str(),
                key,
                value,
                confidence.clamp(0.0, 1.0),
                ts(Utc::now())
            ],
        )?;
        Ok(())
    }

    pub fn list_dynamic_profile(&self, user_id: &str, scope: ProfileScope) -> Result<Vec<ProfileEntry>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT key, value, confidence, updated_at FROM dynamic_profiles
             WHERE user_id = ?1 AND scope = ?2 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![user_id, scope.as_str()], |row| {
            let updated_at: String = row.get(3)?;
            Ok(ProfileEntry {
                scope: Some(scope),
                key: row.get(0)?,
                value: row.get(1)?,
                confidence: row.get(2)?,
                updated_at: parse_ts(&updated_at, "updated_at")?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ========================================================================
    // BEHAVIORAL PATTERNS
    // ========================================================================

    /// Record an observed pattern. Repeats bump the observation counter and
    /// keep the higher confidence.
    pub fn record_pattern(&self, user_id: &str, pattern: &str, confidence: f64) -> Result<BehavioralPattern> {
        let now = ts(Utc::now());
        {
            let writer = self.writer()?;
            writer.execute(
                "INSERT INTO behavioral_patterns
                    (id, user_id, pattern, confidence, observed_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
                 ON CONFLICT(user_id, pattern) DO UPDATE SET
                    observed_count = observed_count + 1,
                    confidence = MAX(confidence, excluded.confidence),
                    updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    user_id,
                    pattern.trim(),
                    confidence.clamp(0.0, 1.0),
                    now
                ],
            )?;
        }

        let reader = self.reader()?;
        let stored = reader.query_row(
            "SELECT * FROM behavioral_patterns WHERE user_id = ?1 AND pattern = ?2",
            params![user_id, pattern.trim()],
            row_to_pattern,
        )?;
        Ok(stored)
    }

    pub fn list_patterns(&self, user_id: &str) -> Result<Vec<BehavioralPattern>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM behavioral_patterns WHERE user_id = ?1
             ORDER BY observed_count DESC, confidence DESC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_pattern)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}
