//! Gap/Engagement Pipeline
//!
//! Turns staleness and unresolved-thread signals into a handful of proactive
//! scheduled items. The judge decides skip / nudge / task per signal; the
//! pipeline bounds the output by the aggressiveness dial and a hard per-run
//! cap, and drops anything that duplicates an item already queued.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GapConfig;
use crate::llm::{CompletionRequest, LlmClient, ParseOutcome};
use crate::memory::{MemoryCategory, MemoryFilter};
use crate::scheduler::{
    AddOutcome, ItemKind, ItemSource, ItemType, NewScheduledItem, ScheduleEngine, ScheduledItem,
};
use crate::storage::{Result, Storage};
use crate::text::{normalize_words, overlap_sets};

/// No run ever emits more than this many items, whatever the dial says
pub const HARD_CAP: usize = 3;

/// Context tag marking items created by this pipeline
pub const GAP_ORIGIN: &str = "gap";

const JUDGE_OPERATION: &str = "gap_judge";

const JUDGE_SYSTEM: &str = "You decide whether a personal assistant should proactively reach out. \
For each numbered signal reply skip, nudge (a short message to send) or task (work to do first). \
Reply with a JSON array of {\"signal\": n, \"decision\": \"skip\"|\"nudge\"|\"task\", \
\"message\": text, \"delay_hours\": number}.";

// ============================================================================
// DIAL
// ============================================================================

/// How eager the assistant is to start conversations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dial {
    Conservative,
    #[default]
    Moderate,
    Eager,
}

impl Dial {
    /// Proactive items allowed per day
    pub fn daily_cap(&self) -> usize {
        match self {
            Dial::Conservative => 1,
            Dial::Moderate => 2,
            Dial::Eager => 5,
        }
    }

    /// Items allowed in one run
    pub fn run_cap(&self) -> usize {
        self.daily_cap().min(HARD_CAP)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dial::Conservative => "conservative",
            Dial::Moderate => "moderate",
            Dial::Eager => "eager",
        }
    }
}

impl FromStr for Dial {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "conservative" => Ok(Dial::Conservative),
            "moderate" => Ok(Dial::Moderate),
            "eager" => Ok(Dial::Eager),
            other => Err(format!("Unknown dial: {}", other)),
        }
    }
}

impl std::fmt::Display for Dial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// SIGNALS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    StaleGoal,
    PastEvent,
    Contradiction,
    /// Anything a caller derives itself
    Custom,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::StaleGoal => "stale_goal",
            SignalKind::PastEvent => "past_event",
            SignalKind::Contradiction => "contradiction",
            SignalKind::Custom => "custom",
        }
    }

    fn item_type(&self) -> ItemType {
        match self {
            SignalKind::StaleGoal => ItemType::GoalCheckin,
            SignalKind::PastEvent => ItemType::FollowUp,
            SignalKind::Contradiction => ItemType::CommitmentCheck,
            SignalKind::Custom => ItemType::Reminder,
        }
    }
}

/// Something that might deserve a proactive message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub kind: SignalKind,
    pub description: String,
    /// Memory the signal came from
    pub source_id: Option<String>,
}

impl Signal {
    pub fn new(kind: SignalKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            source_id: None,
        }
    }

    pub fn with_source(mut self, id: &str) -> Self {
        self.source_id = Some(id.to_string());
        self
    }
}

/// Everything the judge sees for one run
#[derive(Debug, Clone, Default)]
pub struct GapInput {
    pub signals: Vec<Signal>,
    pub dial: Dial,
    /// Current affect, if known ("tired", "upbeat")
    pub mood: Option<String>,
    pub recent_topics: Vec<String>,
    /// Pending items already queued for the user
    pub queued: Vec<ScheduledItem>,
    /// Gap items already created today
    pub sent_today: usize,
}

#[derive(Debug, Deserialize)]
struct Judgement {
    signal: usize,
    #[serde(default)]
    decision: Decision,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    delay_hours: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Decision {
    #[default]
    Skip,
    Nudge,
    Task,
}

/// Same thing said twice: word overlap, or the same source memory
fn duplicates(a_text: &str, a_source: Option<&str>, b_text: &str, b_source: Option<&str>) -> bool {
    if a_source.is_some() && a_source == b_source {
        return true;
    }
    overlap_sets(&normalize_words(a_text), &normalize_words(b_text)).is_duplicate()
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct GapPipeline {
    storage: Arc<Storage>,
    llm: LlmClient,
    config: GapConfig,
}

impl GapPipeline {
    pub fn new(storage: Arc<Storage>, llm: LlmClient, config: GapConfig) -> Self {
        Self { storage, llm, config }
    }

    /// Judge signals and return at most `min(remaining daily cap, 3)`
    /// proposals. Provider failure yields an empty list.
    pub async fn run(&self, user_id: &str, input: &GapInput, now: DateTime<Utc>) -> Vec<NewScheduledItem> {
        let limit = input
            .dial
            .run_cap()
            .min(input.dial.daily_cap().saturating_sub(input.sent_today));
        if limit == 0 || input.signals.is_empty() {
            return Vec::new();
        }

        let request = CompletionRequest::new(JUDGE_OPERATION, JUDGE_SYSTEM, build_prompt(input))
            .with_max_tokens(1024);
        let judgements = match self.llm.complete_json::<Vec<Judgement>>(user_id, request).await {
            Ok(ParseOutcome::Parsed(j)) => j,
            Ok(ParseOutcome::Empty) | Ok(ParseOutcome::Malformed(_)) => return Vec::new(),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Gap judge unavailable, no proactive items this run");
                return Vec::new();
            }
        };

        let mut proposals: Vec<NewScheduledItem> = Vec::new();
        for judgement in judgements {
            if proposals.len() >= limit {
                break;
            }
            let Some(signal) = judgement
                .signal
                .checked_sub(1)
                .and_then(|i| input.signals.get(i))
            else {
                continue;
            };
            let kind = match judgement.decision {
                Decision::Skip => continue,
                Decision::Nudge => ItemKind::Nudge,
                Decision::Task => ItemKind::Task,
            };
            let message = judgement
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| signal.description.clone());

            let source = signal.source_id.as_deref();
            let queued = input.queued.iter().any(|item| {
                duplicates(&message, source, &item.message, item.source_memory_id.as_deref())
            });
            let proposed = proposals.iter().any(|item| {
                duplicates(&message, source, &item.message, item.source_memory_id.as_deref())
            });
            if queued || proposed {
                tracing::debug!(user_id, signal = signal.kind.as_str(), "Gap proposal duplicates a queued item");
                continue;
            }

            let delay_secs = (judgement.delay_hours.unwrap_or(0.0).clamp(0.0, 24.0 * 7.0) * 3600.0) as i64;
            let mut item = NewScheduledItem::nudge(user_id, message, Some(now.timestamp() + delay_secs))
                .with_source(ItemSource::Agent)
                .with_type(signal.kind.item_type())
                .with_context(serde_json::json!({
                    "origin": GAP_ORIGIN,
                    "signal": signal.kind.as_str(),
                }));
            item.kind = kind;
            if let Some(id) = source {
                item = item.with_source_memory(id);
            }
            proposals.push(item);
        }

        proposals
    }

    /// Derive signals from the store
    pub fn collect_signals(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<Signal>> {
        let mut signals = Vec::new();
        let memories = self.storage.list_memories(user_id, &MemoryFilter::default())?;

        let stale_before = now - Duration::days(self.config.stale_goal_days);
        for memory in memories.iter().filter(|m| m.subject() == Some("goal")) {
            if memory.updated_at < stale_before {
                signals.push(
                    Signal::new(SignalKind::StaleGoal, format!("No progress mentioned on goal: {}", memory.content))
                        .with_source(&memory.id),
                );
            }
        }

        let follow_up_after = now - Duration::days(self.config.follow_up_days);
        for memory in memories.iter().filter(|m| m.category == MemoryCategory::Event) {
            if memory
                .event_date
                .is_some_and(|at| at < now && at >= follow_up_after)
            {
                signals.push(
                    Signal::new(SignalKind::PastEvent, format!("Event happened: {}", memory.content))
                        .with_source(&memory.id),
                );
            }
        }

        for (a, b) in self.storage.unresolved_contradictions(user_id)? {
            signals.push(
                Signal::new(
                    SignalKind::Contradiction,
                    format!("Conflicting facts: \"{}\" vs \"{}\"", a.content, b.content),
                )
                .with_source(&a.id),
            );
        }

        signals.truncate(self.config.max_signals);
        Ok(signals)
    }

    /// Topics from recent session summaries, newest first, case-insensitively
    /// deduplicated
    pub fn recent_topics(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let since = now - Duration::hours(self.config.topic_lookback_hours);
        let summaries = self.storage.recent_session_summaries(user_id, since, 0)?;

        let mut seen = std::collections::HashSet::new();
        let mut topics = Vec::new();
        for topic in summaries.iter().flat_map(|s| s.topics.iter()) {
            let topic = topic.trim();
            if topic.is_empty() || !seen.insert(topic.to_lowercase()) {
                continue;
            }
            topics.push(topic.to_string());
            if topics.len() >= self.config.max_topics {
                break;
            }
        }
        Ok(topics)
    }

    /// Full stage for one user: collect, judge, enqueue. Returns the created items.
    pub async fn run_for_user(
        &self,
        scheduler: &ScheduleEngine,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledItem>> {
        let signals = self.collect_signals(user_id, now)?;
        if signals.is_empty() {
            return Ok(Vec::new());
        }

        let day_start = now - Duration::hours(24);
        let sent_today = self
            .storage
            .count_items_with_origin_since(user_id, GAP_ORIGIN, day_start)? as usize;
        let queued = self
            .storage
            .list_scheduled_items(user_id, Some(crate::scheduler::ExecutionStatus::Pending))?;

        let input = GapInput {
            signals,
            dial: self.config.dial,
            recent_topics: self.recent_topics(user_id, now)?,
            queued,
            sent_today,
            ..Default::default()
        };

        let mut created = Vec::new();
        for proposal in self.run(user_id, &input, now).await {
            if let AddOutcome::Created(item) = scheduler.add(proposal)? {
                created.push(item);
            }
        }
        if !created.is_empty() {
            tracing::info!(user_id, created = created.len(), dial = %self.config.dial, "Queued proactive items");
        }
        Ok(created)
    }
}

fn build_prompt(input: &GapInput) -> String {
    let mut prompt = format!("Aggressiveness: {}\n", input.dial);
    if let Some(mood) = &input.mood {
        prompt.push_str(&format!("Current mood: {}\n", mood));
    }
    if !input.recent_topics.is_empty() {
        prompt.push_str(&format!("Recent topics: {}\n", input.recent_topics.join(", ")));
    }
    if !input.queued.is_empty() {
        prompt.push_str("Already queued:\n");
        for item in &input.queued {
            prompt.push_str(&format!("- {}\n", item.message));
        }
    }
    prompt.push_str("Signals:\n");
    for (i, signal) in input.signals.iter().enumerate() {
        prompt.push_str(&format!("{}. [{}] {}\n", i + 1, signal.kind.as_str(), signal.description));
    }
    prompt
}
