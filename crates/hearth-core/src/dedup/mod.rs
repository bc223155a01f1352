//! Dedup & Classifier
//!
//! Turns a batch of extracted candidate facts into store writes:
//!
//! 1. `forget` / `correction` / `preference_update` actions are routed first
//! 2. Remaining facts are embedded in bounded batches
//! 3. A fact at or above the dedup threshold reinforces the existing memory
//! 4. Survivors are classified in one call (NEW / EXTENDS / UPDATES)
//! 5. Every N stored facts a time-bounded consolidation pass is spawned
//!
//! Losing a fact is worse than keeping a duplicate, so every degraded path
//! stores rather than drops.

mod classifier;

pub use classifier::{classify, Classification, Verdict};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DedupConfig;
use crate::embeddings::{cosine_similarity, EmbeddingBatcher};
use crate::llm::{CompletionRequest, LlmClient, LlmError, ParseOutcome};
use crate::memory::{LearnedFrom, MemoryCategory, MemoryEntry, NewMemory, RelationType};
use crate::storage::{ProfileScope, Storage, StorageError};
use crate::text::word_overlap;

// ============================================================================
// TYPES
// ============================================================================

/// What the extractor wants done with a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactAction {
    #[default]
    Fact,
    Forget,
    Correction,
    PreferenceUpdate,
}

/// A fact extracted from a conversation turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactCandidate {
    pub content: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub category: MemoryCategory,
    #[serde(default)]
    pub action: FactAction,
    /// For corrections: the value being replaced
    #[serde(default)]
    pub old_value: Option<String>,
    #[serde(default)]
    pub importance: Option<u8>,
    #[serde(default)]
    pub event_date: Option<DateTime<Utc>>,
}

impl FactCandidate {
    pub fn fact(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            subject: None,
            category: MemoryCategory::Fact,
            action: FactAction::Fact,
            old_value: None,
            importance: None,
            event_date: None,
        }
    }

    pub fn forget(content: impl Into<String>) -> Self {
        Self {
            action: FactAction::Forget,
            ..Self::fact(content)
        }
    }

    pub fn correction(old_value: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            action: FactAction::Correction,
            old_value: Some(old_value.into()),
            ..Self::fact(content)
        }
    }

    pub fn with_category(mut self, category: MemoryCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    fn to_new_memory(&self, user_id: &str) -> NewMemory {
        let mut input = NewMemory::new(user_id, self.content.trim()).with_category(self.category);
        if let Some(subject) = &self.subject {
            input = input.with_subject(subject.clone());
        }
        if let Some(importance) = self.importance {
            input = input.with_importance(importance);
        }
        if let Some(at) = self.event_date {
            input = input.with_event_date(at);
        }
        input.with_metadata("extraction", serde_json::Value::String("conversation".into()))
    }
}

/// What happened to a batch. Failures surface through `error`, never as a
/// panic or a blocked conversation.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionOutcome {
    pub stored: Vec<String>,
    pub reinforced: Vec<String>,
    pub superseded: Vec<String>,
    pub forgotten: Vec<String>,
    /// Candidates discarded by the per-message limit
    pub dropped: usize,
    pub consolidation_scheduled: bool,
    pub error: Option<String>,
}

/// Pipeline failure inside a background pass
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Effect of one consolidation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub superseded: usize,
    pub profile_fields: usize,
    pub patterns: usize,
}

#[derive(Debug, Default, Deserialize)]
struct ConsolidationPlan {
    #[serde(default)]
    supersede: Vec<SupersedePair>,
    #[serde(default)]
    user_profile: BTreeMap<String, String>,
    #[serde(default)]
    agent_profile: BTreeMap<String, String>,
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SupersedePair {
    old: usize,
    new: usize,
}

const CONSOLIDATE_OPERATION: &str = "consolidate_memories";

const CONSOLIDATE_SYSTEM: &str = "You maintain a user's long-term memory. Given numbered facts, \
reply with JSON {\"supersede\": [{\"old\": n, \"new\": m}], \"user_profile\": {key: value}, \
\"agent_profile\": {key: value}, \"patterns\": [text]}. Only supersede when the newer fact \
makes the older one false.";

/// Memories shown to one consolidation pass
const CONSOLIDATION_WINDOW: usize = 50;

// ============================================================================
// PIPELINE
// ============================================================================

#[derive(Clone)]
pub struct FactPipeline {
    storage: Arc<Storage>,
    embedder: Arc<EmbeddingBatcher>,
    llm: LlmClient,
    config: DedupConfig,
    /// Facts stored per user since startup
    stored_counts: Arc<Mutex<HashMap<String, u64>>>,
}

impl FactPipeline {
    pub fn new(
        storage: Arc<Storage>,
        embedder: Arc<EmbeddingBatcher>,
        llm: LlmClient,
        config: DedupConfig,
    ) -> Self {
        Self {
            storage,
            embedder,
            llm,
            config,
            stored_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Process one message's candidates. Returns once synchronous storage and
    /// dedup are done; consolidation, if due, runs in the background.
    pub async fn process(&self, user_id: &str, mut facts: Vec<FactCandidate>) -> ExtractionOutcome {
        let mut outcome = ExtractionOutcome::default();

        facts.retain(|f| !f.content.trim().is_empty());
        if facts.len() > self.config.max_facts_per_message {
            outcome.dropped = facts.len() - self.config.max_facts_per_message;
            tracing::warn!(
                user_id,
                received = facts.len(),
                kept = self.config.max_facts_per_message,
                "Too many facts in one message, truncating"
            );
            facts.truncate(self.config.max_facts_per_message);
        }

        if let Err(e) = self.process_inner(user_id, facts, &mut outcome).await {
            tracing::error!(user_id, error = %e, "Fact extraction failed");
            outcome.error = Some(e.to_string());
        }

        if !outcome.stored.is_empty() {
            outcome.consolidation_scheduled = self.count_stored(user_id, outcome.stored.len() as u64);
        }

        tracing::info!(
            user_id,
            stored = outcome.stored.len(),
            reinforced = outcome.reinforced.len(),
            superseded = outcome.superseded.len(),
            forgotten = outcome.forgotten.len(),
            "Processed extracted facts"
        );
        outcome
    }

    async fn process_inner(
        &self,
        user_id: &str,
        facts: Vec<FactCandidate>,
        outcome: &mut ExtractionOutcome,
    ) -> Result<(), StorageError> {
        let (plain, routed): (Vec<_>, Vec<_>) =
            facts.into_iter().partition(|f| f.action == FactAction::Fact);

        for fact in &routed {
            match fact.action {
                FactAction::Forget => self.forget(user_id, fact, outcome).await?,
                FactAction::Correction | FactAction::PreferenceUpdate => {
                    self.correct(user_id, fact, outcome).await?
                }
                FactAction::Fact => {}
            }
        }

        if plain.is_empty() {
            return Ok(());
        }
        self.store_facts(user_id, plain, outcome).await
    }

    // ------------------------------------------------------------------------
    // Routed actions
    // ------------------------------------------------------------------------

    /// Latest memories matching `text`: by embedding when available, by
    /// keyword plus word overlap when the embedder is down.
    async fn find_matches(
        &self,
        user_id: &str,
        text: &str,
        min_similarity: f32,
    ) -> Result<Vec<MemoryEntry>, StorageError> {
        if let Some(vector) = self.embedder.embed_one(text).await {
            let hits = self
                .storage
                .similar_memories(user_id, &vector, 10, min_similarity, false)?;
            return Ok(hits.into_iter().map(|(m, _)| m).collect());
        }

        tracing::warn!(user_id, "Embedding unavailable, matching by keyword");
        let hits = self.storage.search_memories(user_id, text, 10, false)?;
        Ok(hits
            .into_iter()
            .filter(|m| word_overlap(text, &m.content).is_duplicate())
            .collect())
    }

    async fn forget(
        &self,
        user_id: &str,
        fact: &FactCandidate,
        outcome: &mut ExtractionOutcome,
    ) -> Result<(), StorageError> {
        let matches = self
            .find_matches(user_id, &fact.content, self.config.forget_threshold)
            .await?;
        for memory in matches {
            if self.storage.delete_memory(&memory.id)? {
                tracing::info!(user_id, memory_id = %memory.id, "Forgot memory on request");
                outcome.forgotten.push(memory.id);
            }
        }
        Ok(())
    }

    async fn correct(
        &self,
        user_id: &str,
        fact: &FactCandidate,
        outcome: &mut ExtractionOutcome,
    ) -> Result<(), StorageError> {
        let query = fact.old_value.as_deref().unwrap_or(&fact.content);
        let matches = self
            .find_matches(user_id, query, self.config.correction_threshold)
            .await?;

        let mut input = fact
            .to_new_memory(user_id)
            .with_confidence(self.config.correction_confidence)
            .with_learned_from(LearnedFrom::Correction);
        if let Some(vector) = self.embedder.embed_one(&fact.content).await {
            input = input.with_embedding(vector);
        }
        let corrected = self.storage.insert_memory(input)?;

        for old in matches {
            self.storage
                .add_relation(&corrected.id, &old.id, RelationType::Updates, 1.0)?;
            self.storage.add_contradiction(&corrected.id, &old.id)?;
            outcome.superseded.push(old.id);
        }
        outcome.stored.push(corrected.id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Plain facts
    // ------------------------------------------------------------------------

    async fn store_facts(
        &self,
        user_id: &str,
        facts: Vec<FactCandidate>,
        outcome: &mut ExtractionOutcome,
    ) -> Result<(), StorageError> {
        let texts: Vec<String> = facts.iter().map(|f| f.content.trim().to_string()).collect();
        let vectors = self.embedder.embed_all(&texts).await;

        let mut survivors: Vec<(FactCandidate, Option<Vec<f32>>)> = Vec::new();
        let mut relevant: Vec<MemoryEntry> = Vec::new();
        let mut relevant_ids: HashSet<String> = HashSet::new();

        for (fact, vector) in facts.into_iter().zip(vectors) {
            let Some(vector) = vector else {
                tracing::warn!(user_id, "No embedding for fact, skipping similarity checks");
                survivors.push((fact, None));
                continue;
            };

            // Same fact twice in one message
            let repeated = survivors.iter().any(|(_, v)| {
                v.as_deref()
                    .is_some_and(|v| cosine_similarity(v, &vector) >= self.config.dedup_threshold)
            });
            if repeated {
                continue;
            }

            let hits = self.storage.similar_memories(
                user_id,
                &vector,
                self.config.relevant_per_fact,
                self.config.relevance_floor.min(self.config.dedup_threshold),
                false,
            )?;

            let duplicate = hits
                .first()
                .filter(|(_, similarity)| *similarity >= self.config.dedup_threshold);
            if let Some((existing, similarity)) = duplicate {
                tracing::debug!(
                    user_id,
                    memory_id = %existing.id,
                    similarity = *similarity,
                    "Duplicate fact, reinforcing"
                );
                if self.storage.reinforce_memory(&existing.id, Utc::now())?.is_some() {
                    outcome.reinforced.push(existing.id.clone());
                }
                continue;
            }

            for (memory, _) in hits {
                if relevant_ids.insert(memory.id.clone()) {
                    relevant.push(memory);
                }
            }
            survivors.push((fact, Some(vector)));
        }

        if survivors.is_empty() {
            return Ok(());
        }

        let contents: Vec<String> = survivors.iter().map(|(f, _)| f.content.trim().to_string()).collect();
        let verdicts = classify(&self.llm, user_id, &contents, &relevant).await;

        for ((fact, vector), verdict) in survivors.into_iter().zip(verdicts) {
            let mut input = fact.to_new_memory(user_id);
            if let Some(vector) = vector {
                input = input.with_embedding(vector);
            }
            let stored = self.storage.insert_memory(input)?;

            if let Some(target) = verdict.target.and_then(|t| relevant.get(t)) {
                match verdict.verdict {
                    Verdict::Updates => {
                        self.storage
                            .add_relation(&stored.id, &target.id, RelationType::Updates, 0.9)?;
                        outcome.superseded.push(target.id.clone());
                    }
                    Verdict::Extends => {
                        self.storage
                            .add_relation(&stored.id, &target.id, RelationType::Extends, 0.9)?;
                    }
                    Verdict::New => {}
                }
            }
            outcome.stored.push(stored.id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Consolidation
    // ------------------------------------------------------------------------

    /// Add to the user's stored-fact counter. Spawns consolidation for that
    /// user when an interval boundary is crossed; returns whether it did.
    fn count_stored(&self, user_id: &str, stored: u64) -> bool {
        let interval = self.config.consolidation_interval.max(1);
        let before = match self.stored_counts.lock() {
            Ok(mut counts) => {
                let count = counts.entry(user_id.to_string()).or_insert(0);
                let before = *count;
                *count += stored;
                before
            }
            Err(_) => {
                tracing::warn!(user_id, "Stored-fact counter lock poisoned");
                return false;
            }
        };
        if (before + stored) / interval == before / interval {
            return false;
        }

        let pipeline = self.clone();
        let user = user_id.to_string();
        crate::jobs::spawn_bounded(
            "consolidation",
            Duration::from_secs(self.config.consolidation_timeout_secs),
            async move {
                if let Err(e) = pipeline.consolidate_now(&user).await {
                    tracing::warn!(user_id = %user, error = %e, "Consolidation pass failed");
                }
            },
        )
        .is_some()
    }

    /// Run one consolidation pass over the user's most recent latest memories
    pub async fn consolidate_now(&self, user_id: &str) -> Result<ConsolidationReport, PipelineError> {
        let memories = self.storage.recent_memories(user_id, CONSOLIDATION_WINDOW)?;
        let mut report = ConsolidationReport::default();
        if memories.len() < 2 {
            return Ok(report);
        }

        let mut prompt = String::from("Facts (newest first):\n");
        for (i, memory) in memories.iter().enumerate() {
            prompt.push_str(&format!("{}. [{}] {}\n", i + 1, memory.category, memory.content));
        }
        let request = CompletionRequest::new(CONSOLIDATE_OPERATION, CONSOLIDATE_SYSTEM, prompt);

        let plan = match self.llm.complete_json::<ConsolidationPlan>(user_id, request).await? {
            ParseOutcome::Parsed(plan) => plan,
            ParseOutcome::Empty | ParseOutcome::Malformed(_) => return Ok(report),
        };

        let by_index = |n: usize| n.checked_sub(1).and_then(|i| memories.get(i));
        for pair in plan.supersede {
            let (Some(old), Some(new)) = (by_index(pair.old), by_index(pair.new)) else {
                continue;
            };
            if old.id == new.id {
                continue;
            }
            self.storage
                .add_relation(&new.id, &old.id, RelationType::Updates, 0.8)?;
            report.superseded += 1;
        }

        for (scope, fields) in [
            (ProfileScope::User, &plan.user_profile),
            (ProfileScope::Agent, &plan.agent_profile),
        ] {
            for (key, value) in fields {
                if key.trim().is_empty() || value.trim().is_empty() {
                    continue;
                }
                self.storage
                    .upsert_dynamic_profile(user_id, scope, key.trim(), value.trim(), 0.7)?;
                report.profile_fields += 1;
            }
        }

        for pattern in plan.patterns.iter().filter(|p| !p.trim().is_empty()) {
            self.storage.record_pattern(user_id, pattern, 0.6)?;
            report.patterns += 1;
        }

        tracing::info!(
            user_id,
            superseded = report.superseded,
            profile_fields = report.profile_fields,
            patterns = report.patterns,
            "Consolidation pass complete"
        );
        Ok(report)
    }
}
