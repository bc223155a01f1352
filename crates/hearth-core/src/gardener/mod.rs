//! Background Gardener
//!
//! Tick-driven maintenance with two cadences:
//!
//! - **Light tick** (every few minutes): embedding backlog, decay, pruning,
//!   scheduled-item expiry and dedup, session retention.
//! - **Sleep tick** (about once a day, only inside quiet hours): dream
//!   cycle, self-reflection, gap pipeline.
//!
//! Every stage is isolated. A failing stage is logged and the tick goes on.

mod dream;
mod reflection;

pub use dream::{DreamCycle, DreamReport};
pub use reflection::{ReflectionOutcome, Reflector, SkipReason};

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;

use crate::config::HearthConfig;
use crate::decay::DecayEngine;
use crate::embeddings::EmbeddingBatcher;
use crate::gaps::GapPipeline;
use crate::llm::{LlmClient, LlmError};
use crate::scheduler::ScheduleEngine;
use crate::storage::{Storage, StorageError};

/// Memories embedded per user per light tick
const EMBED_BACKLOG_LIMIT: usize = 64;

/// Failure inside a gardener stage
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum GardenerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("Workspace write failed: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// QUIET HOURS / TICK COUNTER
// ============================================================================

/// Hour window `[start, end)` in UTC. `start > end` wraps past midnight;
/// `start == end` is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start: u32,
    pub end: u32,
}

impl QuietHours {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start: start % 24,
            end: end % 24,
        }
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.start < self.end {
            self.start <= hour && hour < self.end
        } else if self.start > self.end {
            hour >= self.start || hour < self.end
        } else {
            false
        }
    }
}

/// Sleep-tick counter. Counts every light tick; fires once the threshold is
/// reached and the hour is quiet. Outside quiet hours firing is deferred and
/// the count is kept.
#[derive(Debug, Clone)]
pub struct TickState {
    counter: u32,
    threshold: u32,
    quiet: QuietHours,
}

impl TickState {
    pub fn new(threshold: u32, quiet: QuietHours) -> Self {
        Self {
            counter: 0,
            threshold: threshold.max(1),
            quiet,
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Record one light tick at `hour`. Returns true when a sleep tick is due.
    pub fn advance(&mut self, hour: u32) -> bool {
        self.counter = self.counter.saturating_add(1);
        if self.counter >= self.threshold && self.quiet.contains(hour) {
            self.counter = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }
}

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LightReport {
    pub embedded: usize,
    pub decayed: usize,
    pub archived: usize,
    pub pruned_memories: usize,
    pub recovered_items: usize,
    pub expired_items: usize,
    pub merged_items: usize,
    pub purged_items: usize,
    pub pruned_sessions: usize,
    /// Stages that failed this tick
    pub failed: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepReport {
    pub users: usize,
    pub fused: usize,
    pub insights: usize,
    pub reflections: usize,
    pub gap_items: usize,
    pub failed: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub light: LightReport,
    pub sleep: Option<SleepReport>,
}

/// Log a failed stage and remember its name
fn isolate<T, E: std::fmt::Display>(
    stage: &'static str,
    failed: &mut Vec<&'static str>,
    result: Result<T, E>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(stage, error = %e, "Gardener stage failed");
            failed.push(stage);
            None
        }
    }
}

// ============================================================================
// GARDENER
// ============================================================================

pub struct Gardener {
    storage: Arc<Storage>,
    scheduler: ScheduleEngine,
    decay: DecayEngine,
    embedder: Option<Arc<EmbeddingBatcher>>,
    dream: DreamCycle,
    reflector: Reflector,
    gaps: GapPipeline,
    session_retention_days: i64,
    state: Mutex<TickState>,
}

impl Gardener {
    pub fn new(
        storage: Arc<Storage>,
        llm: LlmClient,
        embedder: Option<Arc<EmbeddingBatcher>>,
        config: &HearthConfig,
    ) -> Self {
        let quiet = QuietHours::new(config.gardener.quiet_start, config.gardener.quiet_end);
        Self {
            scheduler: ScheduleEngine::new(storage.clone(), config.scheduler.clone()),
            decay: DecayEngine::new(config.decay.clone()),
            dream: DreamCycle::new(storage.clone(), llm.clone(), config.gardener.clone()),
            reflector: Reflector::new(storage.clone(), llm.clone(), config.reflection.clone()),
            gaps: GapPipeline::new(storage.clone(), llm, config.gaps.clone()),
            session_retention_days: config.store.session_retention_days,
            state: Mutex::new(TickState::new(config.gardener.sleep_threshold, quiet)),
            embedder,
            storage,
        }
    }

    pub fn scheduler(&self) -> &ScheduleEngine {
        &self.scheduler
    }

    /// Current sleep-tick counter
    pub fn sleep_counter(&self) -> u32 {
        self.state.lock().map(|s| s.counter()).unwrap_or(0)
    }

    /// One light tick, followed by a sleep tick when the counter fires
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let light = self.light_tick(now).await;

        let fire = match self.state.lock() {
            Ok(mut state) => state.advance(now.hour()),
            Err(_) => {
                tracing::warn!("Tick state lock poisoned, sleep tick skipped");
                false
            }
        };

        let sleep = if fire {
            Some(self.sleep_tick(now).await)
        } else {
            None
        };
        TickReport { light, sleep }
    }

    /// Bookkeeping stages
    pub async fn light_tick(&self, now: DateTime<Utc>) -> LightReport {
        let started = std::time::Instant::now();
        let mut report = LightReport::default();

        if let Some(embedder) = &self.embedder {
            let result = self.embed_backlog(embedder).await;
            report.embedded = isolate("embed_backlog", &mut report.failed, result).unwrap_or(0);
        }

        let result = self.storage.apply_decay(&self.decay, now);
        if let Some(decay) = isolate("decay", &mut report.failed, result) {
            report.decayed = decay.updated;
            report.archived = decay.archived;
        }

        let result = self.storage.prune_decayed(&self.decay, now);
        report.pruned_memories = isolate("prune_memories", &mut report.failed, result).unwrap_or(0);

        let result = self.scheduler.recover_stale(now);
        report.recovered_items = isolate("recover_items", &mut report.failed, result).unwrap_or(0);

        let result = self.scheduler.expire_overdue(now);
        report.expired_items = isolate("expire_items", &mut report.failed, result).unwrap_or(0);

        let result = self.scheduler.consolidate_all();
        report.merged_items = isolate("merge_items", &mut report.failed, result).unwrap_or(0);

        let result = self.scheduler.purge_terminal(now);
        report.purged_items = isolate("purge_items", &mut report.failed, result).unwrap_or(0);

        let cutoff = Storage::session_cutoff(now, self.session_retention_days);
        let result = self.storage.prune_sessions(cutoff);
        report.pruned_sessions = isolate("prune_sessions", &mut report.failed, result).unwrap_or(0);

        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            decayed = report.decayed,
            archived = report.archived,
            expired = report.expired_items,
            failed = report.failed.len(),
            "Light tick finished"
        );
        report
    }

    /// Heavy stages for every user: dream, then reflection, then gaps.
    /// Resets the sleep counter.
    pub async fn sleep_tick(&self, now: DateTime<Utc>) -> SleepReport {
        if let Ok(mut state) = self.state.lock() {
            state.reset();
        }

        let mut report = SleepReport::default();
        let users = match isolate("list_users", &mut report.failed, self.storage.list_users()) {
            Some(users) => users,
            None => return report,
        };
        report.users = users.len();

        for user_id in &users {
            let result = self.dream.dream(user_id).await;
            if let Some(dream) = isolate("dream", &mut report.failed, result) {
                report.fused += dream.fused.len();
                report.insights += dream.insights.len();
            }

            let result = self.reflector.reflect(user_id, now).await;
            if let Some(ReflectionOutcome::Reflected { insights, .. }) =
                isolate("reflection", &mut report.failed, result)
            {
                report.reflections += 1;
                report.insights += insights.len();
            }

            let result = self.gaps.run_for_user(&self.scheduler, user_id, now).await;
            if let Some(items) = isolate("gaps", &mut report.failed, result) {
                report.gap_items += items.len();
            }
        }

        tracing::info!(
            users = report.users,
            fused = report.fused,
            insights = report.insights,
            reflections = report.reflections,
            gap_items = report.gap_items,
            failed = report.failed.len(),
            "Sleep tick finished"
        );
        report
    }

    async fn embed_backlog(&self, embedder: &EmbeddingBatcher) -> crate::storage::Result<usize> {
        let mut embedded = 0;
        for user_id in self.storage.list_users()? {
            let pending = self.storage.memories_without_embedding(&user_id, EMBED_BACKLOG_LIMIT)?;
            if pending.is_empty() {
                continue;
            }
            let texts: Vec<String> = pending.iter().map(|m| m.content.clone()).collect();
            let vectors = embedder.embed_all(&texts).await;
            for (memory, vector) in pending.iter().zip(vectors) {
                if let Some(vector) = vector {
                    if self.storage.set_embedding(&memory.id, &vector)? {
                        embedded += 1;
                    }
                }
            }
        }
        Ok(embedded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GardenerConfig, ReflectionConfig};
    use crate::memory::{LearnedFrom, MemoryFilter, NewMemory, RelationType};
    use crate::scheduler::{ExecutionStatus, NewScheduledItem};
    use crate::storage::SessionSummary;
    use crate::testing::{HashEmbedder, ScriptedProvider};
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        gardener: Gardener,
        provider: Arc<ScriptedProvider>,
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    fn fixture(workspace: bool, threshold: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("test.db"))).unwrap());
        let provider = Arc::new(ScriptedProvider::new());
        let config = HearthConfig {
            gardener: GardenerConfig {
                sleep_threshold: threshold,
                quiet_start: 23,
                quiet_end: 5,
                rem_pairs: 0,
                ..Default::default()
            },
            reflection: ReflectionConfig {
                workspace: workspace.then(|| dir.path().join("workspace")),
                ..Default::default()
            },
            ..Default::default()
        };
        let embedder = Arc::new(EmbeddingBatcher::new(
            Arc::new(HashEmbedder::new(16)),
            &config.embedding,
        ));
        let gardener = Gardener::new(
            storage.clone(),
            LlmClient::untracked(provider.clone()),
            Some(embedder),
            &config,
        );
        Fixture {
            gardener,
            provider,
            storage,
            _dir: dir,
        }
    }

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_quiet_hours_windows() {
        let normal = QuietHours::new(2, 6);
        assert!(normal.contains(2));
        assert!(normal.contains(5));
        assert!(!normal.contains(6));
        assert!(!normal.contains(1));

        let wrapping = QuietHours::new(23, 5);
        for hour in 0..24 {
            assert_eq!(wrapping.contains(hour), hour >= 23 || hour < 5, "hour {}", hour);
        }

        assert!(!QuietHours::new(4, 4).contains(4));
    }

    #[test]
    fn test_counter_fires_once_per_threshold() {
        let mut state = TickState::new(288, QuietHours::new(0, 23));
        let fired: Vec<u32> = (1..=576).filter(|_| state.advance(3)).collect();
        assert_eq!(fired, vec![288, 576]);
        assert_eq!(state.counter(), 0);
    }

    #[test]
    fn test_empty_quiet_window_never_fires() {
        // 24 wraps to 0, so this is start == end
        let mut state = TickState::new(2, QuietHours::new(0, 24));
        assert!((0..24).all(|hour| !state.advance(hour)));
        assert_eq!(state.counter(), 24);
    }

    #[test]
    fn test_counter_defers_outside_quiet_hours() {
        let mut state = TickState::new(3, QuietHours::new(23, 5));
        assert!(!state.advance(12));
        assert!(!state.advance(12));
        assert!(!state.advance(12));
        assert!(!state.advance(22));
        // Deferred, not dropped
        assert_eq!(state.counter(), 4);
        assert!(state.advance(23));
        assert_eq!(state.counter(), 0);
        assert!(!state.advance(0));
    }

    #[tokio::test]
    async fn test_light_tick_runs_bookkeeping() {
        let f = fixture(false, 288);
        let now = at_hour(12);
        let memory = f.storage.insert_memory(NewMemory::new("u", "Likes jazz")).unwrap();
        let overdue = f
            .storage
            .insert_scheduled_item(NewScheduledItem::nudge(
                "u",
                "Call the plumber",
                Some((now - Duration::days(3)).timestamp()),
            ))
            .unwrap();

        let report = f.gardener.tick(now).await;
        assert!(report.light.failed.is_empty());
        assert!(report.sleep.is_none());
        assert_eq!(report.light.embedded, 1);
        assert_eq!(report.light.expired_items, 1);
        assert_eq!(f.gardener.sleep_counter(), 1);

        assert!(f.storage.get_memory(&memory.id).unwrap().unwrap().embedding.is_some());
        let item = f.storage.get_scheduled_item(&overdue.id).unwrap().unwrap();
        assert_eq!(item.status, ExecutionStatus::Expired);
    }

    #[tokio::test]
    async fn test_light_tick_recovers_stale_claims() {
        let f = fixture(false, 288);
        let now = Utc::now();
        let item = f
            .storage
            .insert_scheduled_item(NewScheduledItem::nudge("u", "Collect the parcel", Some(now.timestamp() - 60)))
            .unwrap();
        assert_eq!(f.storage.claim_due_items(now.timestamp()).unwrap().len(), 1);

        let report = f.gardener.light_tick(now).await;
        assert_eq!(report.recovered_items, 0);

        let report = f.gardener.light_tick(now + Duration::hours(1)).await;
        assert!(report.failed.is_empty());
        assert_eq!(report.recovered_items, 1);
        assert_eq!(report.expired_items, 0);
        let item = f.storage.get_scheduled_item(&item.id).unwrap().unwrap();
        assert_eq!(item.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn test_sleep_tick_fires_in_quiet_hours() {
        let f = fixture(false, 2);
        assert!(f.gardener.tick(at_hour(12)).await.sleep.is_none());
        // Threshold reached outside quiet hours
        assert!(f.gardener.tick(at_hour(13)).await.sleep.is_none());
        assert_eq!(f.gardener.sleep_counter(), 2);
        assert!(f.gardener.tick(at_hour(1)).await.sleep.is_some());
        assert_eq!(f.gardener.sleep_counter(), 0);
    }

    #[tokio::test]
    async fn test_reflection_failure_keeps_dream_output() {
        let f = fixture(true, 288);
        let a = f.storage.insert_memory(NewMemory::new("u", "Plays chess online")).unwrap();
        let b = f.storage.insert_memory(NewMemory::new("u", "Plays chess at the club")).unwrap();
        let c = f.storage.insert_memory(NewMemory::new("u", "Rated 1600 in chess")).unwrap();
        f.storage.add_relation(&b.id, &a.id, RelationType::Extends, 0.9).unwrap();
        f.storage.add_relation(&c.id, &b.id, RelationType::Extends, 0.9).unwrap();
        for i in 0..2 {
            f.storage
                .save_session_summary(&SessionSummary::new("u", format!("Chess session {}", i), 4))
                .unwrap();
        }

        f.provider.respond_json(
            dream::NREM_OPERATION,
            json!({"summary": "Active club and online chess player rated 1600", "importance": 6}),
        );
        f.provider.fail(reflection::REFLECTION_OPERATION);

        let report = f.gardener.sleep_tick(Utc::now()).await;
        assert_eq!(report.fused, 1);
        assert_eq!(report.reflections, 0);
        assert_eq!(report.failed, vec!["reflection"]);

        let fused = f
            .storage
            .list_memories(
                "u",
                &MemoryFilter {
                    learned_from: Some(LearnedFrom::NremConsolidation),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(fused.len(), 1);
        let reflected = f
            .storage
            .list_memories(
                "u",
                &MemoryFilter {
                    learned_from: Some(LearnedFrom::SelfReflection),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(reflected.is_empty());
    }
}
