//! Dream cycle
//!
//! Two passes run during a sleep tick:
//!
//! 1. **NREM**: clusters of memories linked by UPDATES/EXTENDS edges are
//!    fused into one derived summary, linked back to its inputs with DERIVES.
//! 2. **REM**: random memory pairs are shown to an external judge, which
//!    scores a proposed connection. Only connections clearing every
//!    threshold become insight memories.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::GardenerError;
use crate::config::GardenerConfig;
use crate::llm::{CompletionRequest, LlmClient, ParseOutcome};
use crate::memory::{
    LearnedFrom, MemoryCategory, MemoryEntry, MemoryFilter, MemorySource, MemoryType, NewMemory,
    RelationType,
};
use crate::storage::Storage;
use crate::text::is_duplicate;

pub(crate) const NREM_OPERATION: &str = "nrem_fuse";
pub(crate) const REM_OPERATION: &str = "rem_judge";

const NREM_SYSTEM: &str = "You merge closely related facts about a user into one durable summary. \
Reply with JSON {\"summary\": text, \"category\": \"preference\"|\"fact\"|\"event\"|\"relationship\"|\"insight\", \
\"importance\": 1-10}.";

const REM_SYSTEM: &str = "You look for a non-obvious connection between two facts about a user. \
Reply with JSON {\"insight\": text, \"novelty\": 0-1, \"plausibility\": 0-1, \"usefulness\": 0-1, \
\"confidence\": 0-1}. Use an empty insight when there is nothing worth saying.";

/// REM samples from the most prominent memories only
const REM_POOL: usize = 50;

#[derive(Debug, Deserialize)]
struct Fusion {
    summary: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    importance: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct Judgement {
    #[serde(default)]
    insight: String,
    #[serde(default)]
    novelty: f64,
    #[serde(default)]
    plausibility: f64,
    #[serde(default)]
    usefulness: f64,
    #[serde(default)]
    confidence: f64,
}

/// What one dream pass produced for a user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamReport {
    /// Summary memories created by NREM fusion
    pub fused: Vec<String>,
    /// Insight memories created by REM exploration
    pub insights: Vec<String>,
    /// REM pairs the judge rejected
    pub rejected: usize,
}

pub struct DreamCycle {
    storage: Arc<Storage>,
    llm: LlmClient,
    config: GardenerConfig,
}

impl DreamCycle {
    pub fn new(storage: Arc<Storage>, llm: LlmClient, config: GardenerConfig) -> Self {
        Self { storage, llm, config }
    }

    /// Run NREM then REM for one user
    pub async fn dream(&self, user_id: &str) -> Result<DreamReport, GardenerError> {
        let mut report = DreamReport::default();
        self.nrem(user_id, &mut report).await?;
        self.rem(user_id, &mut report).await?;
        if !report.fused.is_empty() || !report.insights.is_empty() {
            tracing::info!(
                user_id,
                fused = report.fused.len(),
                insights = report.insights.len(),
                rejected = report.rejected,
                "Dream cycle finished"
            );
        }
        Ok(report)
    }

    async fn nrem(&self, user_id: &str, report: &mut DreamReport) -> Result<(), GardenerError> {
        let clusters = self
            .storage
            .relation_clusters(user_id, self.config.nrem_min_cluster.max(2))?;

        for cluster in clusters.into_iter().take(self.config.nrem_max_clusters) {
            let mut prompt = String::from("Related facts:\n");
            for (i, memory) in cluster.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", i + 1, memory.content));
            }
            let request = CompletionRequest::new(NREM_OPERATION, NREM_SYSTEM, prompt).with_max_tokens(512);

            let fusion = match self.llm.complete_json::<Fusion>(user_id, request).await {
                Ok(ParseOutcome::Parsed(f)) if !f.summary.trim().is_empty() => f,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(user_id, size = cluster.len(), error = %e, "NREM fusion failed for cluster");
                    continue;
                }
            };

            let importance = fusion
                .importance
                .unwrap_or_else(|| cluster.iter().map(|m| m.importance).max().unwrap_or(5))
                .clamp(1, 10);
            let category = fusion
                .category
                .as_deref()
                .map(MemoryCategory::parse_name)
                .unwrap_or(cluster[0].category);
            let confidence = cluster.iter().map(|m| m.confidence).sum::<f64>() / cluster.len() as f64;

            let summary = self.storage.insert_memory(
                NewMemory::new(user_id, fusion.summary.trim())
                    .with_category(category)
                    .with_type(MemoryType::Derived)
                    .with_importance(importance)
                    .with_confidence(confidence)
                    .with_source(MemorySource::Assistant)
                    .with_learned_from(LearnedFrom::NremConsolidation)
                    .with_metadata("clusterSize", serde_json::json!(cluster.len())),
            )?;
            for member in &cluster {
                self.storage
                    .add_relation(&summary.id, &member.id, RelationType::Derives, 1.0)?;
            }
            report.fused.push(summary.id);
        }
        Ok(())
    }

    async fn rem(&self, user_id: &str, report: &mut DreamReport) -> Result<(), GardenerError> {
        let filter = MemoryFilter {
            limit: Some(REM_POOL),
            ..Default::default()
        };
        let pool: Vec<MemoryEntry> = self
            .storage
            .list_memories(user_id, &filter)?
            .into_iter()
            .filter(|m| m.memory_type != MemoryType::Derived)
            .collect();
        if pool.len() < 2 {
            return Ok(());
        }

        let pairs = sample_pairs(pool.len(), self.config.rem_pairs);
        let existing_insights = self.storage.list_memories(
            user_id,
            &MemoryFilter {
                category: Some(MemoryCategory::Insight),
                ..Default::default()
            },
        )?;
        let mut seen: Vec<String> = existing_insights.into_iter().map(|m| m.content).collect();

        for (a, b) in pairs {
            let (left, right) = (&pool[a], &pool[b]);
            let prompt = format!("Fact A: {}\nFact B: {}", left.content, right.content);
            let request = CompletionRequest::new(REM_OPERATION, REM_SYSTEM, prompt).with_max_tokens(512);

            let judgement = match self.llm.complete_json::<Judgement>(user_id, request).await {
                Ok(ParseOutcome::Parsed(j)) => j,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "REM judge unavailable, ending exploration");
                    break;
                }
            };

            let insight = judgement.insight.trim();
            if insight.is_empty() || !self.accepts(&judgement) {
                report.rejected += 1;
                continue;
            }
            if seen.iter().any(|s| is_duplicate(s, insight)) {
                tracing::debug!(user_id, "REM insight already known");
                continue;
            }

            let memory = self.storage.insert_memory(
                NewMemory::new(user_id, insight)
                    .with_category(MemoryCategory::Insight)
                    .with_type(MemoryType::Derived)
                    .with_confidence(judgement.confidence.clamp(0.0, 1.0))
                    .with_source(MemorySource::Assistant)
                    .with_learned_from(LearnedFrom::Inference)
                    .with_metadata("novelty", serde_json::json!(judgement.novelty))
                    .with_metadata("usefulness", serde_json::json!(judgement.usefulness)),
            )?;
            self.storage
                .add_relation(&memory.id, &left.id, RelationType::Derives, judgement.confidence)?;
            self.storage
                .add_relation(&memory.id, &right.id, RelationType::Derives, judgement.confidence)?;
            seen.push(memory.content);
            report.insights.push(memory.id);
        }
        Ok(())
    }

    fn accepts(&self, j: &Judgement) -> bool {
        j.novelty >= self.config.rem_min_novelty
            && j.plausibility >= self.config.rem_min_plausibility
            && j.usefulness >= self.config.rem_min_usefulness
            && j.confidence >= self.config.rem_min_confidence
    }
}

/// Up to `count` distinct unordered index pairs from `0..len`
fn sample_pairs(len: usize, count: usize) -> Vec<(usize, usize)> {
    if count == 0 || len < 2 {
        return Vec::new();
    }
    let mut rng = rand::rng();
    let mut indices: Vec<usize> = (0..len).collect();
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();

    // Disjoint pairs from a few shuffles
    for _ in 0..count * 2 {
        indices.shuffle(&mut rng);
        for chunk in indices.chunks_exact(2) {
            let pair = (chunk[0].min(chunk[1]), chunk[0].max(chunk[1]));
            if seen.insert(pair) {
                pairs.push(pair);
            }
            if pairs.len() >= count {
                return pairs;
            }
        }
    }
    pairs
}
