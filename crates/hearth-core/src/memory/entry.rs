//! Memory Entry - The fundamental unit of knowledge
//!
//! Each entry carries:
//! - Content, category and lifecycle type
//! - Importance / confidence / prominence scores
//! - Two independent timestamps: document date and event date
//! - Provenance (learned-from, confirmations, contradictions)

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{seed_importance, LearnedFrom, MemoryCategory, MemorySource, MemoryType};

// ============================================================================
// MEMORY ENTRY
// ============================================================================

/// A stored memory
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// The knowledge itself
    pub content: String,
    pub category: MemoryCategory,
    pub memory_type: MemoryType,
    /// Author-assigned durability weight (1-10)
    pub importance: u8,
    /// Belief in the statement (0-1)
    pub confidence: f64,
    /// False once superseded or archived
    pub is_latest: bool,
    pub source: MemorySource,

    // ========== Time ==========
    /// When the memory was recorded
    pub document_date: DateTime<Utc>,
    /// When the described event occurs, if it is an event
    pub event_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Last user-visible edit. Maintenance never touches this.
    pub updated_at: DateTime<Utc>,

    // ========== Decay ==========
    /// Continuous decay score (0-1)
    pub prominence: f64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub access_count: i64,

    // ========== Provenance ==========
    pub learned_from: LearnedFrom,
    /// Reinforcement counter
    pub times_confirmed: i64,
    /// Memories that conflict with this one (bidirectional)
    pub contradiction_ids: Vec<String>,
    /// Free-form provenance: extraction source, subject, original category
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Embedding vector, if one was computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryEntry {
    /// Materialize an input as a fresh latest memory created at `at`.
    /// Importance is seeded from category and subject when not given.
    pub fn from_new(input: NewMemory, at: DateTime<Utc>) -> Self {
        let importance = input
            .importance
            .unwrap_or_else(|| seed_importance(input.category, input.subject.as_deref()));

        let mut metadata = input.metadata;
        if let Some(subject) = input.subject {
            metadata.insert("subject".to_string(), serde_json::Value::String(subject));
        }

        Self {
            id: Uuid::new_v4().to_string(),
            user_id: input.user_id,
            content: input.content,
            category: input.category,
            memory_type: input.memory_type,
            importance,
            confidence: input.confidence.clamp(0.0, 1.0),
            is_latest: input.memory_type != MemoryType::Superseded,
            source: input.source,
            document_date: at,
            event_date: input.event_date,
            created_at: at,
            updated_at: at,
            prominence: 1.0,
            last_accessed: None,
            access_count: 0,
            learned_from: input.learned_from,
            times_confirmed: 0,
            contradiction_ids: Vec::new(),
            metadata,
            embedding: input.embedding,
        }
    }

    /// Subject recorded in metadata, if any
    pub fn subject(&self) -> Option<&str> {
        self.metadata.get("subject").and_then(|v| v.as_str())
    }

    /// Reference time for decay: last access, or creation
    pub fn decay_reference(&self) -> DateTime<Utc> {
        self.last_accessed.unwrap_or(self.created_at)
    }

    /// Whether this memory was superseded or archived
    pub fn is_superseded(&self) -> bool {
        !self.is_latest || self.memory_type == MemoryType::Superseded
    }
}

// ============================================================================
// INPUT
// ============================================================================

/// Input for creating a memory
///
/// Uses `deny_unknown_fields` so callers cannot smuggle in stored-only state.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct NewMemory {
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub category: MemoryCategory,
    #[serde(default)]
    pub memory_type: MemoryType,
    /// Seeded from category/subject when absent
    #[serde(default)]
    pub importance: Option<u8>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub source: MemorySource,
    #[serde(default)]
    pub event_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub learned_from: LearnedFrom,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

fn default_confidence() -> f64 {
    0.8
}

impl NewMemory {
    /// Minimal input: a regular user-stated fact
    pub fn new(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            content: content.into(),
            category: MemoryCategory::Fact,
            memory_type: MemoryType::Regular,
            importance: None,
            confidence: default_confidence(),
            source: MemorySource::User,
            event_date: None,
            learned_from: LearnedFrom::Conversation,
            subject: None,
            metadata: BTreeMap::new(),
            embedding: None,
        }
    }

    pub fn with_category(mut self, category: MemoryCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = Some(importance.clamp(1, 10));
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_source(mut self, source: MemorySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_learned_from(mut self, learned_from: LearnedFrom) -> Self {
        self.learned_from = learned_from;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_event_date(mut self, at: DateTime<Utc>) -> Self {
        self.event_date = Some(at);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

// ============================================================================
// QUERIES
// ============================================================================

/// Filter for listing memories
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub category: Option<MemoryCategory>,
    pub learned_from: Option<LearnedFrom>,
    /// Include superseded / archived rows
    pub include_superseded: bool,
    pub limit: Option<usize>,
}

/// Per-user store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total: i64,
    pub latest: i64,
    pub superseded: i64,
    pub with_embedding: i64,
    pub average_prominence: f64,
    pub by_category: BTreeMap<String, i64>,
    pub relations: i64,
}
