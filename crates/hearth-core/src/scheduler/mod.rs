//! Scheduled-Item Engine
//!
//! Durable queue of nudges and tasks on top of [`Storage`]:
//! - Duplicate suppression by normalized word overlap within a time window
//! - Atomic claim of due items, release on delivery failure
//! - Recurring items re-inserted with their next trigger after firing
//! - Expiry and archival sweeps driven by the gardener

mod item;
mod state;

pub use item::{
    BoardUpdate, ItemKind, ItemSource, ItemType, NewScheduledItem, Recurrence, RecurrencePattern,
    ScheduledItem,
};
pub use state::{project_board, transition, BoardHold, BoardStatus, ExecutionStatus, ItemEvent};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::config::SchedulerConfig;
use crate::storage::{Result, Storage};
use crate::text::{normalize_words, overlap_sets};

// ============================================================================
// DELIVERY CONTRACT
// ============================================================================

/// Failure reported by an [`ItemHandler`]
#[derive(Debug, Clone, thiserror::Error)]
#[error("Delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Receives claimed items. Nudges are delivered as text, tasks are handed to
/// a sub-agent whose result is stored on the item.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn deliver(&self, item: &ScheduledItem) -> std::result::Result<(), DeliveryError>;

    async fn run_task(&self, item: &ScheduledItem) -> std::result::Result<String, DeliveryError>;
}

/// Result of inserting an item through the engine
#[derive(Debug, Clone)]
pub enum AddOutcome {
    Created(ScheduledItem),
    /// A similar pending item already exists
    Duplicate(String),
}

impl AddOutcome {
    pub fn item_id(&self) -> &str {
        match self {
            AddOutcome::Created(item) => &item.id,
            AddOutcome::Duplicate(id) => id,
        }
    }
}

/// Counters from one delivery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub claimed: usize,
    pub fired: usize,
    pub released: usize,
    pub recurring: usize,
    /// Items left in `processing` by a storage error; the stale sweep
    /// returns them to the queue
    pub stranded: usize,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ScheduleEngine {
    storage: Arc<Storage>,
    config: SchedulerConfig,
}

impl ScheduleEngine {
    pub fn new(storage: Arc<Storage>, config: SchedulerConfig) -> Self {
        Self { storage, config }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.config.dedup_window_days)
    }

    /// Insert unless a similar pending item was created within the window
    pub fn add(&self, input: NewScheduledItem) -> Result<AddOutcome> {
        let pending = self
            .storage
            .pending_items_since(&input.user_id, self.window_start(Utc::now()))?;
        let words = normalize_words(&input.message);

        if let Some(existing) = pending
            .iter()
            .find(|item| overlap_sets(&normalize_words(&item.message), &words).is_duplicate())
        {
            tracing::debug!(
                user_id = %input.user_id,
                existing_id = %existing.id,
                "Suppressed duplicate scheduled item"
            );
            return Ok(AddOutcome::Duplicate(existing.id.clone()));
        }

        let item = self.storage.insert_scheduled_item(input)?;
        tracing::info!(
            user_id = %item.user_id,
            item_id = %item.id,
            kind = item.kind.as_str(),
            trigger_at = ?item.trigger_at,
            "Scheduled item"
        );
        Ok(AddOutcome::Created(item))
    }

    /// Whether a pending item within the window says roughly the same thing
    pub fn has_similar_pending(&self, user_id: &str, text: &str) -> Result<bool> {
        let words = normalize_words(text);
        let pending = self
            .storage
            .pending_items_since(user_id, self.window_start(Utc::now()))?;
        Ok(pending
            .iter()
            .any(|item| overlap_sets(&normalize_words(&item.message), &words).is_duplicate()))
    }

    pub fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledItem>> {
        self.storage.get_due_items(now.timestamp())
    }

    pub fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledItem>> {
        self.storage.claim_due_items(now.timestamp())
    }

    /// Mark an item fired. A recurring item gets its next occurrence inserted
    /// as a fresh pending row, which is returned.
    pub fn mark_fired(&self, id: &str, now: DateTime<Utc>) -> Result<Option<ScheduledItem>> {
        if !self.storage.apply_item_event(id, ItemEvent::Fire, now)? {
            return Ok(None);
        }

        let Some(item) = self.storage.get_scheduled_item(id)? else {
            return Ok(None);
        };
        let Some(recurrence) = item.recurrence else {
            return Ok(None);
        };

        let after = item.trigger_at.unwrap_or(now.timestamp()).max(now.timestamp());
        let next = NewScheduledItem {
            user_id: item.user_id,
            session_id: item.session_id,
            source: item.source,
            kind: item.kind,
            item_type: item.item_type,
            message: item.message,
            context: item.context,
            allowed_tools: item.allowed_tools,
            trigger_at: Some(recurrence.next_trigger(after)),
            recurrence: Some(recurrence),
            board_hold: None,
            priority: item.priority,
            labels: item.labels,
            depends_on: item.depends_on,
            goal_id: item.goal_id,
            source_memory_id: item.source_memory_id,
        };
        let next = self.storage.insert_scheduled_item(next)?;
        tracing::debug!(item_id = %id, next_id = %next.id, trigger_at = ?next.trigger_at, "Re-armed recurring item");
        Ok(Some(next))
    }

    pub fn mark_dismissed(&self, id: &str) -> Result<bool> {
        self.storage.apply_item_event(id, ItemEvent::Dismiss, Utc::now())
    }

    pub fn mark_acted(&self, id: &str) -> Result<bool> {
        self.storage.apply_item_event(id, ItemEvent::Act, Utc::now())
    }

    /// Return a claimed item to the queue
    pub fn release(&self, id: &str) -> Result<bool> {
        self.storage.apply_item_event(id, ItemEvent::Release, Utc::now())
    }

    pub fn reschedule(&self, id: &str, trigger_at: Option<i64>) -> Result<bool> {
        self.storage.reschedule_item(id, trigger_at)
    }

    pub fn update_board_fields(&self, id: &str, update: &BoardUpdate) -> Result<bool> {
        self.storage.update_board_fields(id, update)
    }

    pub fn store_result(&self, id: &str, result: &str) -> Result<bool> {
        self.storage.store_item_result(id, result)
    }

    /// Claim everything due and hand it to `handler`. Items whose delivery
    /// fails go back to `pending`.
    pub async fn run_due(&self, now: DateTime<Utc>, handler: &dyn ItemHandler) -> Result<RunReport> {
        let claimed = self.claim_due(now)?;
        let mut report = RunReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        for item in claimed {
            let delivered = match item.kind {
                ItemKind::Nudge => handler.deliver(&item).await,
                ItemKind::Task => self.run_task(&item, handler).await,
            };

            match delivered {
                Ok(()) => match self.mark_fired(&item.id, now) {
                    Ok(next) => {
                        if next.is_some() {
                            report.recurring += 1;
                        }
                        report.fired += 1;
                    }
                    Err(e) => {
                        tracing::warn!(item_id = %item.id, error = %e, "Delivered but could not mark fired");
                        report.stranded += 1;
                    }
                },
                Err(e) => {
                    tracing::warn!(item_id = %item.id, error = %e, "Delivery failed, releasing item");
                    match self.release(&item.id) {
                        Ok(_) => report.released += 1,
                        Err(e) => {
                            tracing::warn!(item_id = %item.id, error = %e, "Failed to release item");
                            report.stranded += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    async fn run_task(
        &self,
        item: &ScheduledItem,
        handler: &dyn ItemHandler,
    ) -> std::result::Result<(), DeliveryError> {
        let run = self
            .storage
            .start_subagent_run(item)
            .map_err(|e| DeliveryError(e.to_string()))?;

        match handler.run_task(item).await {
            Ok(result) => {
                let stored = self
                    .storage
                    .finish_subagent_run(&run.id, true, Some(&result))
                    .and_then(|_| self.storage.store_item_result(&item.id, &result));
                if let Err(e) = stored {
                    tracing::warn!(item_id = %item.id, error = %e, "Failed to store task result");
                }
                Ok(())
            }
            Err(e) => {
                if let Err(store_err) = self.storage.finish_subagent_run(&run.id, false, Some(&e.0)) {
                    tracing::warn!(run_id = %run.id, error = %store_err, "Failed to close sub-agent run");
                }
                Err(e)
            }
        }
    }

    /// Dismiss pending items that duplicate an earlier pending item. The
    /// earliest-created item of each group survives.
    pub fn consolidate_duplicates(&self, user_id: &str) -> Result<usize> {
        let mut pending = self
            .storage
            .list_scheduled_items(user_id, Some(ExecutionStatus::Pending))?;
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let words: Vec<_> = pending.iter().map(|i| normalize_words(&i.message)).collect();
        let mut dismissed = vec![false; pending.len()];
        let mut count = 0;

        for keep in 0..pending.len() {
            if dismissed[keep] {
                continue;
            }
            for other in keep + 1..pending.len() {
                if dismissed[other] || !overlap_sets(&words[keep], &words[other]).is_duplicate() {
                    continue;
                }
                if self.mark_dismissed(&pending[other].id)? {
                    dismissed[other] = true;
                    count += 1;
                }
            }
        }

        if count > 0 {
            tracing::info!(user_id, dismissed = count, "Merged duplicate scheduled items");
        }
        Ok(count)
    }

    /// Run duplicate consolidation for every user with pending items
    pub fn consolidate_all(&self) -> Result<usize> {
        let mut total = 0;
        for user in self.storage.users_with_pending_items()? {
            total += self.consolidate_duplicates(&user)?;
        }
        Ok(total)
    }

    /// Expire non-recurring pending items more than the grace period overdue
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::hours(self.config.expire_grace_hours);
        self.storage.expire_overdue_items(cutoff.timestamp())
    }

    /// Return items claimed longer ago than the stale window to `pending`
    pub fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let older_than = now - Duration::minutes(self.config.stale_processing_minutes);
        self.storage.release_stale_items(older_than)
    }

    /// Delete terminal items older than the retention period
    pub fn purge_terminal(&self, now: DateTime<Utc>) -> Result<usize> {
        self.storage
            .purge_terminal_items(now - Duration::days(self.config.purge_after_days))
    }
}
