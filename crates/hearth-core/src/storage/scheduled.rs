//! Scheduled-item persistence
//!
//! Every status write goes through `transition` and re-projects the board
//! lane, inside an IMMEDIATE transaction so concurrent schedulers serialize
//! on the reserved lock.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use super::sqlite::{parse_opt_ts, parse_ts, ts, Result, Storage, StorageError};
use crate::memory::MemoryEntry;
use crate::scheduler::{
    project_board, transition, BoardHold, BoardStatus, BoardUpdate, ExecutionStatus, ItemEvent,
    ItemKind, ItemSource, ItemType, NewScheduledItem, ScheduledItem,
};
use crate::text::{normalize_words, overlap_sets};

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<ScheduledItem> {
    let source: String = row.get("source")?;
    let kind: String = row.get("kind")?;
    let item_type: String = row.get("item_type")?;
    let status: String = row.get("status")?;
    let board_status: Option<String> = row.get("board_status")?;
    let board_hold: Option<String> = row.get("board_hold")?;
    let context: Option<String> = row.get("context")?;
    let recurrence: Option<String> = row.get("recurrence")?;
    let allowed_tools: String = row.get("allowed_tools")?;
    let labels: String = row.get("labels")?;
    let depends_on: String = row.get("depends_on")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    let status = ExecutionStatus::parse_name(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("Unknown item status '{}'", status).into(),
        )
    })?;
    let trigger_at: Option<i64> = row.get("trigger_at")?;
    let board_hold = board_hold.as_deref().and_then(BoardHold::parse_name);

    Ok(ScheduledItem {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        session_id: row.get("session_id")?,
        source: ItemSource::parse_name(&source),
        kind: ItemKind::parse_name(&kind),
        item_type: ItemType::parse_name(&item_type),
        message: row.get("message")?,
        context: context.and_then(|c| serde_json::from_str(&c).ok()),
        allowed_tools: serde_json::from_str(&allowed_tools).unwrap_or_default(),
        trigger_at,
        recurrence: recurrence.and_then(|r| serde_json::from_str(&r).ok()),
        status,
        board_status: board_status
            .as_deref()
            .and_then(BoardStatus::parse_name)
            .unwrap_or_else(|| project_board(status, trigger_at, board_hold)),
        board_hold,
        priority: row.get("priority")?,
        labels: serde_json::from_str(&labels).unwrap_or_default(),
        depends_on: serde_json::from_str(&depends_on).unwrap_or_default(),
        goal_id: row.get("goal_id")?,
        result: row.get("result")?,
        source_memory_id: row.get("source_memory_id")?,
        created_at: parse_ts(&created_at, "created_at")?,
        updated_at: parse_ts(&updated_at, "updated_at")?,
        fired_at: parse_opt_ts(row.get("fired_at")?, "fired_at")?,
    })
}

fn query_items(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ScheduledItem>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_item)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Expire pending items tied to a deleted memory, by id or by text.
/// Runs on the caller's transaction.
pub(super) fn expire_items_for_memory(conn: &Connection, memory: &MemoryEntry) -> Result<usize> {
    let pending = query_items(
        conn,
        "SELECT * FROM scheduled_items WHERE user_id = ?1 AND status = 'pending'",
        params![memory.user_id],
    )?;

    let memory_words = normalize_words(&memory.content);
    let now = ts(Utc::now());
    let mut expired = 0;

    for item in pending {
        let by_id = item.source_memory_id.as_deref() == Some(memory.id.as_str());
        let by_text = overlap_sets(&normalize_words(&item.message), &memory_words).is_duplicate();
        if !(by_id || by_text) {
            continue;
        }
        expired += conn.execute(
            "UPDATE scheduled_items SET status = ?1, board_status = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![
                ExecutionStatus::Expired.as_str(),
                project_board(ExecutionStatus::Expired, item.trigger_at, item.board_hold).as_str(),
                now,
                item.id
            ],
        )?;
    }
    Ok(expired)
}

impl Storage {
    /// Persist a new scheduled item (pending, board projected)
    pub fn insert_scheduled_item(&self, input: NewScheduledItem) -> Result<ScheduledItem> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let status = ExecutionStatus::Pending;
        let board = project_board(status, input.trigger_at, input.board_hold);

        let context = input.context.as_ref().map(serde_json::to_string).transpose()?;
        let recurrence = input.recurrence.as_ref().map(serde_json::to_string).transpose()?;

        {
            let writer = self.writer()?;
            writer.execute(
                "INSERT INTO scheduled_items (
                    id, user_id, session_id, source, kind, item_type, message, context,
                    allowed_tools, trigger_at, recurrence, status, source_memory_id,
                    created_at, updated_at, board_status, board_hold, priority, labels,
                    depends_on, goal_id
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                    ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19,
                    ?20, ?21
                )",
                params![
                    id,
                    input.user_id,
                    input.session_id,
                    input.source.as_str(),
                    input.kind.as_str(),
                    input.item_type.as_str(),
                    input.message,
                    context,
                    serde_json::to_string(&input.allowed_tools)?,
                    input.trigger_at,
                    recurrence,
                    status.as_str(),
                    input.source_memory_id,
                    ts(now),
                    ts(now),
                    board.as_str(),
                    input.board_hold.map(|h| h.as_str()),
                    input.priority,
                    serde_json::to_string(&input.labels)?,
                    serde_json::to_string(&input.depends_on)?,
                    input.goal_id,
                ],
            )?;
        }

        self.get_scheduled_item(&id)?
            .ok_or(StorageError::NotFound(id))
    }

    pub fn get_scheduled_item(&self, id: &str) -> Result<Option<ScheduledItem>> {
        let reader = self.reader()?;
        let item = reader
            .query_row(
                "SELECT * FROM scheduled_items WHERE id = ?1",
                params![id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    /// A user's items, optionally restricted to one status
    pub fn list_scheduled_items(
        &self,
        user_id: &str,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ScheduledItem>> {
        let reader = self.reader()?;
        query_items(
            &reader,
            "SELECT * FROM scheduled_items
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY COALESCE(trigger_at, 9223372036854775807), created_at",
            params![user_id, status.map(|s| s.as_str())],
        )
    }

    /// Pending items whose trigger time has passed (read-only peek)
    pub fn get_due_items(&self, now: i64) -> Result<Vec<ScheduledItem>> {
        let reader = self.reader()?;
        query_items(
            &reader,
            "SELECT * FROM scheduled_items
             WHERE status = 'pending' AND trigger_at IS NOT NULL AND trigger_at <= ?1
             ORDER BY trigger_at, created_at",
            params![now],
        )
    }

    /// Atomically claim every due pending item.
    ///
    /// Select and flip to `processing` happen in one IMMEDIATE transaction,
    /// so two overlapping claimers can never both receive the same item.
    pub fn claim_due_items(&self, now: i64) -> Result<Vec<ScheduledItem>> {
        let mut writer = self.writer()?;
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let due = query_items(
            &tx,
            "SELECT * FROM scheduled_items
             WHERE status = 'pending' AND trigger_at IS NOT NULL AND trigger_at <= ?1
             ORDER BY trigger_at, created_at",
            params![now],
        )?;

        let updated_at = ts(Utc::now());
        let mut claimed = Vec::with_capacity(due.len());
        for mut item in due {
            let Some(next) = transition(item.status, ItemEvent::Claim) else {
                continue;
            };
            let board = project_board(next, item.trigger_at, item.board_hold);
            let rows = tx.execute(
                "UPDATE scheduled_items SET status = ?1, board_status = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![next.as_str(), board.as_str(), updated_at, item.id],
            )?;
            if rows == 1 {
                item.status = next;
                item.board_status = board;
                claimed.push(item);
            }
        }

        tx.commit()?;
        if !claimed.is_empty() {
            tracing::debug!(count = claimed.len(), "Claimed due items");
        }
        Ok(claimed)
    }

    /// Apply a lifecycle event. Returns false (and changes nothing) when the
    /// event is not valid from the item's current status.
    pub fn apply_item_event(&self, id: &str, event: ItemEvent, now: DateTime<Utc>) -> Result<bool> {
        let mut writer = self.writer()?;
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(String, Option<i64>, Option<String>)> = tx
            .query_row(
                "SELECT status, trigger_at, board_hold FROM scheduled_items WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((status, trigger_at, hold)) = current else {
            return Err(StorageError::NotFound(id.to_string()));
        };
        let Some(from) = ExecutionStatus::parse_name(&status) else {
            return Err(StorageError::InvalidTransition(format!(
                "item {} has unknown status '{}'",
                id, status
            )));
        };

        let Some(next) = transition(from, event) else {
            tracing::debug!(item_id = %id, from = %from, ?event, "Ignoring invalid item transition");
            return Ok(false);
        };

        let hold = hold.as_deref().and_then(BoardHold::parse_name);
        let board = project_board(next, trigger_at, hold);
        let fired_at = matches!(event, ItemEvent::Fire | ItemEvent::Act).then(|| ts(now));

        let rows = tx.execute(
            "UPDATE scheduled_items
             SET status = ?1, board_status = ?2, updated_at = ?3,
                 fired_at = COALESCE(?4, fired_at)
             WHERE id = ?5 AND status = ?6",
            params![next.as_str(), board.as_str(), ts(now), fired_at, id, from.as_str()],
        )?;
        tx.commit()?;
        Ok(rows == 1)
    }

    /// Move a pending item's trigger. `None` unschedules it (inbox).
    pub fn reschedule_item(&self, id: &str, trigger_at: Option<i64>) -> Result<bool> {
        let mut writer = self.writer()?;
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, board_hold FROM scheduled_items WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((status, hold)) = current else {
            return Ok(false);
        };
        if status != ExecutionStatus::Pending.as_str() {
            return Err(StorageError::InvalidTransition(format!(
                "cannot reschedule item {} in status {}",
                id, status
            )));
        }

        let hold = hold.as_deref().and_then(BoardHold::parse_name);
        let board = project_board(ExecutionStatus::Pending, trigger_at, hold);
        let rows = tx.execute(
            "UPDATE scheduled_items SET trigger_at = ?1, board_status = ?2, updated_at = ?3
             WHERE id = ?4",
            params![trigger_at, board.as_str(), ts(Utc::now()), id],
        )?;
        tx.commit()?;
        Ok(rows == 1)
    }

    /// Update user-editable board fields. Changing the hold lane is only
    /// allowed while the item is pending.
    pub fn update_board_fields(&self, id: &str, update: &BoardUpdate) -> Result<bool> {
        let mut writer = self.writer()?;
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                "SELECT * FROM scheduled_items WHERE id = ?1",
                params![id],
                row_to_item,
            )
            .optional()?;
        let Some(item) = current else {
            return Ok(false);
        };

        let hold = match update.hold {
            Some(new_hold) if new_hold != item.board_hold => {
                if item.status != ExecutionStatus::Pending {
                    return Err(StorageError::InvalidTransition(format!(
                        "cannot change board lane of item {} in status {}",
                        id, item.status
                    )));
                }
                new_hold
            }
            _ => item.board_hold,
        };
        let board = project_board(item.status, item.trigger_at, hold);

        let labels = update.labels.as_ref().unwrap_or(&item.labels);
        let depends_on = update.depends_on.as_ref().unwrap_or(&item.depends_on);
        let goal_id = update.goal_id.clone().unwrap_or(item.goal_id);

        let rows = tx.execute(
            "UPDATE scheduled_items
             SET board_hold = ?1, board_status = ?2, priority = ?3, labels = ?4,
                 depends_on = ?5, goal_id = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                hold.map(|h| h.as_str()),
                board.as_str(),
                update.priority.unwrap_or(item.priority),
                serde_json::to_string(labels)?,
                serde_json::to_string(depends_on)?,
                goal_id,
                ts(Utc::now()),
                id
            ],
        )?;
        tx.commit()?;
        Ok(rows == 1)
    }

    /// Record the outcome of a completed task
    pub fn store_item_result(&self, id: &str, result: &str) -> Result<bool> {
        let writer = self.writer()?;
        let rows = writer.execute(
            "UPDATE scheduled_items SET result = ?1, updated_at = ?2 WHERE id = ?3",
            params![result, ts(Utc::now()), id],
        )?;
        Ok(rows > 0)
    }

    /// Pending items for a user created at or after `since`
    pub fn pending_items_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<ScheduledItem>> {
        let reader = self.reader()?;
        query_items(
            &reader,
            "SELECT * FROM scheduled_items
             WHERE user_id = ?1 AND status = 'pending' AND created_at >= ?2
             ORDER BY created_at, id",
            params![user_id, ts(since)],
        )
    }

    pub fn users_with_pending_items(&self) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT DISTINCT user_id FROM scheduled_items WHERE status = 'pending' ORDER BY user_id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Items with a given origin tag (`context.origin`) created since `since`
    pub fn count_items_with_origin_since(
        &self,
        user_id: &str,
        origin: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let reader = self.reader()?;
        let count = reader.query_row(
            "SELECT COUNT(*) FROM scheduled_items
             WHERE user_id = ?1 AND created_at >= ?2
               AND json_extract(context, '$.origin') = ?3",
            params![user_id, ts(since), origin],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Expire non-recurring pending items whose trigger is older than
    /// `cutoff` (epoch seconds). Returns how many expired.
    pub fn expire_overdue_items(&self, cutoff: i64) -> Result<usize> {
        let mut writer = self.writer()?;
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let overdue = query_items(
            &tx,
            "SELECT * FROM scheduled_items
             WHERE status = 'pending' AND recurrence IS NULL
               AND trigger_at IS NOT NULL AND trigger_at < ?1",
            params![cutoff],
        )?;

        let now = ts(Utc::now());
        let mut expired = 0;
        for item in overdue {
            let Some(next) = transition(item.status, ItemEvent::Expire) else {
                continue;
            };
            expired += tx.execute(
                "UPDATE scheduled_items SET status = ?1, board_status = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![
                    next.as_str(),
                    project_board(next, item.trigger_at, item.board_hold).as_str(),
                    now,
                    item.id
                ],
            )?;
        }
        tx.commit()?;
        Ok(expired)
    }

    /// Return items stuck in `processing` since before `older_than` to the
    /// queue. Covers a delivery pass that died between claim and fire.
    pub fn release_stale_items(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut writer = self.writer()?;
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale = query_items(
            &tx,
            "SELECT * FROM scheduled_items WHERE status = 'processing' AND updated_at < ?1",
            params![ts(older_than)],
        )?;

        let now = ts(Utc::now());
        let mut released = 0;
        for item in stale {
            let Some(next) = transition(item.status, ItemEvent::Release) else {
                continue;
            };
            released += tx.execute(
                "UPDATE scheduled_items SET status = ?1, board_status = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'processing'",
                params![
                    next.as_str(),
                    project_board(next, item.trigger_at, item.board_hold).as_str(),
                    now,
                    item.id
                ],
            )?;
        }
        tx.commit()?;
        if released > 0 {
            tracing::info!(released, "Released stale processing items");
        }
        Ok(released)
    }

    /// Archival sweep: delete terminal items last touched before `older_than`
    pub fn purge_terminal_items(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let writer = self.writer()?;
        let rows = writer.execute(
            "DELETE FROM scheduled_items
             WHERE status IN ('fired', 'dismissed', 'expired', 'acted') AND updated_at < ?1",
            params![ts(older_than)],
        )?;
        Ok(rows)
    }

    /// Hard-delete one item
    pub fn delete_scheduled_item(&self, id: &str) -> Result<bool> {
        let writer = self.writer()?;
        let rows = writer.execute("DELETE FROM scheduled_items WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }
}
