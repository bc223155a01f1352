//! Self-reflection
//!
//! Reads recent session summaries, asks the provider what the assistant
//! should learn from them, and keeps the answer in two places: insight
//! memories and the user's own guidelines document in the workspace. The
//! document is rewritten on every run, after the insights are stored.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use super::GardenerError;
use crate::config::ReflectionConfig;
use crate::llm::{CompletionRequest, LlmClient, ParseOutcome};
use crate::memory::{LearnedFrom, MemoryCategory, MemorySource, MemoryType, NewMemory};
use crate::storage::Storage;

pub(crate) const REFLECTION_OPERATION: &str = "reflection";

const REFLECTION_SYSTEM: &str = "You review summaries of an assistant's recent conversations with a user. \
Reply with JSON {\"insights\": [text], \"guidelines\": markdown}. Insights are short observations \
about the user. Guidelines are the complete, current list of behaviours the assistant should follow.";

#[derive(Debug, Default, Deserialize)]
struct ReflectionPlan {
    #[serde(default)]
    insights: Vec<String>,
    #[serde(default)]
    guidelines: String,
}

/// Why reflection did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoWorkspace,
    NotEnoughSessions,
    NoOutput,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReflectionOutcome {
    Skipped(SkipReason),
    Reflected {
        insights: Vec<String>,
        guidelines: PathBuf,
    },
}

pub struct Reflector {
    storage: Arc<Storage>,
    llm: LlmClient,
    config: ReflectionConfig,
}

impl Reflector {
    pub fn new(storage: Arc<Storage>, llm: LlmClient, config: ReflectionConfig) -> Self {
        Self { storage, llm, config }
    }

    pub async fn reflect(&self, user_id: &str, now: DateTime<Utc>) -> Result<ReflectionOutcome, GardenerError> {
        let Some(guidelines) = self.config.guidelines_path(user_id) else {
            return Ok(ReflectionOutcome::Skipped(SkipReason::NoWorkspace));
        };

        let since = now - Duration::hours(self.config.lookback_hours);
        let summaries = self
            .storage
            .recent_session_summaries(user_id, since, self.config.min_messages)?;
        if summaries.len() < self.config.min_sessions.max(1) {
            tracing::debug!(user_id, sessions = summaries.len(), "Not enough recent sessions to reflect on");
            return Ok(ReflectionOutcome::Skipped(SkipReason::NotEnoughSessions));
        }

        let mut prompt = String::from("Recent sessions:\n");
        for (i, summary) in summaries.iter().enumerate() {
            prompt.push_str(&format!("{}. ({} messages) {}\n", i + 1, summary.message_count, summary.summary));
        }
        let current = std::fs::read_to_string(&guidelines).unwrap_or_default();
        if !current.trim().is_empty() {
            prompt.push_str("\nCurrent guidelines:\n");
            prompt.push_str(&current);
        }

        let request = CompletionRequest::new(REFLECTION_OPERATION, REFLECTION_SYSTEM, prompt).with_max_tokens(2048);
        let plan = match self.llm.complete_json::<ReflectionPlan>(user_id, request).await? {
            ParseOutcome::Parsed(plan) if !plan.guidelines.trim().is_empty() || !plan.insights.is_empty() => plan,
            _ => return Ok(ReflectionOutcome::Skipped(SkipReason::NoOutput)),
        };

        let mut insights = Vec::new();
        for text in plan.insights.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let memory = self.storage.insert_memory(
                NewMemory::new(user_id, text)
                    .with_category(MemoryCategory::Insight)
                    .with_type(MemoryType::Derived)
                    .with_source(MemorySource::Assistant)
                    .with_learned_from(LearnedFrom::SelfReflection)
                    .with_metadata("sessions", serde_json::json!(summaries.len())),
            )?;
            insights.push(memory.id);
        }

        if !plan.guidelines.trim().is_empty() {
            write_replacing(&guidelines, plan.guidelines.trim())?;
        }

        tracing::info!(user_id, insights = insights.len(), sessions = summaries.len(), "Reflection finished");
        Ok(ReflectionOutcome::Reflected { insights, guidelines })
    }
}

/// Replace `path` with `contents` through a sibling temp file
fn write_replacing(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, format!("{}\n", contents))?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SessionSummary;
    use crate::testing::ScriptedProvider;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        reflector: Reflector,
        provider: Arc<ScriptedProvider>,
        storage: Arc<Storage>,
        workspace: PathBuf,
        _dir: TempDir,
    }

    fn fixture(with_workspace: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("test.db"))).unwrap());
        let provider = Arc::new(ScriptedProvider::new());
        let workspace = dir.path().join("workspace");
        let config = ReflectionConfig {
            workspace: with_workspace.then(|| workspace.clone()),
            ..Default::default()
        };
        Fixture {
            reflector: Reflector::new(storage.clone(), LlmClient::untracked(provider.clone()), config),
            provider,
            storage,
            workspace,
            _dir: dir,
        }
    }

    fn seed_sessions(storage: &Storage, user_id: &str, count: usize, messages: i64) {
        for i in 0..count {
            storage
                .save_session_summary(&SessionSummary::new(user_id, format!("Talked about plans {}", i), messages))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_skips_without_workspace() {
        let f = fixture(false);
        seed_sessions(&f.storage, "u", 3, 5);
        let outcome = f.reflector.reflect("u", Utc::now()).await.unwrap();
        assert_eq!(outcome, ReflectionOutcome::Skipped(SkipReason::NoWorkspace));
        assert_eq!(f.provider.calls(REFLECTION_OPERATION), 0);
    }

    #[tokio::test]
    async fn test_skips_short_sessions() {
        let f = fixture(true);
        seed_sessions(&f.storage, "u", 3, 2);
        let outcome = f.reflector.reflect("u", Utc::now()).await.unwrap();
        assert_eq!(outcome, ReflectionOutcome::Skipped(SkipReason::NotEnoughSessions));
        assert!(!f.workspace.join("u").join("GUIDELINES.md").exists());
    }

    #[tokio::test]
    async fn test_reflection_rewrites_guidelines() {
        let f = fixture(true);
        seed_sessions(&f.storage, "u", 2, 3);
        f.provider.respond_json(
            REFLECTION_OPERATION,
            json!({"insights": ["Prefers short answers in the morning"], "guidelines": "- Keep morning replies brief"}),
        );

        let outcome = f.reflector.reflect("u", Utc::now()).await.unwrap();
        let ReflectionOutcome::Reflected { insights, guidelines } = outcome else {
            panic!("expected reflection");
        };
        assert_eq!(insights.len(), 1);
        let insight = f.storage.get_memory(&insights[0]).unwrap().unwrap();
        assert_eq!(insight.learned_from, LearnedFrom::SelfReflection);
        assert_eq!(insight.category, MemoryCategory::Insight);
        assert_eq!(std::fs::read_to_string(&guidelines).unwrap(), "- Keep morning replies brief\n");

        f.provider.reset(REFLECTION_OPERATION).respond_json(
            REFLECTION_OPERATION,
            json!({"insights": [], "guidelines": "- Keep morning replies brief\n- Ask before scheduling"}),
        );
        f.reflector.reflect("u", Utc::now()).await.unwrap();
        let doc = std::fs::read_to_string(&guidelines).unwrap();
        assert_eq!(doc.matches("Keep morning replies brief").count(), 1);
        assert!(doc.contains("Ask before scheduling"));

        // The second prompt carried the current document
        let requests = f.provider.requests_for(REFLECTION_OPERATION);
        assert!(requests[1].messages[0].content.contains("Current guidelines"));
    }

    #[tokio::test]
    async fn test_guidelines_are_kept_per_user() {
        let f = fixture(true);
        seed_sessions(&f.storage, "alice", 2, 4);
        seed_sessions(&f.storage, "bob", 2, 4);
        f.provider.respond_json(
            REFLECTION_OPERATION,
            json!({"insights": [], "guidelines": "- Alice likes bullet points"}),
        );
        f.reflector.reflect("alice", Utc::now()).await.unwrap();

        f.provider.reset(REFLECTION_OPERATION).respond_json(
            REFLECTION_OPERATION,
            json!({"insights": [], "guidelines": "- Bob wants full sentences"}),
        );
        f.reflector.reflect("bob", Utc::now()).await.unwrap();

        let alice = std::fs::read_to_string(f.workspace.join("alice").join("GUIDELINES.md")).unwrap();
        let bob = std::fs::read_to_string(f.workspace.join("bob").join("GUIDELINES.md")).unwrap();
        assert!(alice.contains("bullet points"));
        assert!(bob.contains("full sentences"));

        // Bob's prompt never saw Alice's document
        let requests = f.provider.requests_for(REFLECTION_OPERATION);
        assert!(!requests[0].messages[0].content.contains("Current guidelines"));
        assert!(!requests[1].messages[0].content.contains("bullet points"));
    }

    #[tokio::test]
    async fn test_failed_insight_store_leaves_document_alone() {
        let f = fixture(true);
        seed_sessions(&f.storage, "u", 2, 4);
        let path = f.workspace.join("u").join("GUIDELINES.md");
        write_replacing(&path, "- Previous guidance").unwrap();

        f.provider.respond_json(
            REFLECTION_OPERATION,
            json!({"insights": ["Learns Portuguese on the train"], "guidelines": "- Replacement guidance"}),
        );
        f.storage
            .writer()
            .unwrap()
            .execute_batch("DROP TABLE memories")
            .unwrap();

        assert!(f.reflector.reflect("u", Utc::now()).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "- Previous guidance\n");
    }

    #[tokio::test]
    async fn test_provider_failure_writes_nothing() {
        let f = fixture(true);
        seed_sessions(&f.storage, "u", 2, 4);
        f.provider.fail(REFLECTION_OPERATION);

        assert!(f.reflector.reflect("u", Utc::now()).await.is_err());
        assert!(!f.workspace.join("u").join("GUIDELINES.md").exists());
        let reflected = f
            .storage
            .list_memories(
                "u",
                &crate::memory::MemoryFilter {
                    learned_from: Some(LearnedFrom::SelfReflection),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(reflected.is_empty());
    }
}
