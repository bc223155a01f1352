//! Model usage accounting and the sub-agent run log

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sqlite::{micros, parse_opt_ts, parse_ts, ts, Result, Storage};
use crate::llm::{TokenUsage, UsageSink};
use crate::scheduler::ScheduledItem;

impl UsageSink for Storage {
    fn record(&self, user_id: &str, operation: &str, model: &str, usage: &TokenUsage) {
        let result = self.writer().and_then(|writer| {
            writer.execute(
                "INSERT INTO cost_usage (user_id, operation, model, input_tokens, output_tokens, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user_id,
                    operation,
                    model,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    ts(Utc::now())
                ],
            )?;
            Ok(())
        });

        if let Err(e) = result {
            tracing::warn!(operation, error = %e, "Failed to record model usage");
        }
    }
}

/// Token totals for one operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub operation: String,
    pub calls: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// One execution of a task item by a sub-agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRun {
    pub id: String,
    pub user_id: String,
    pub scheduled_item_id: Option<String>,
    pub goal: String,
    /// running | succeeded | failed
    pub status: String,
    pub result: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<SubagentRun> {
    let started_at: String = row.get("started_at")?;
    Ok(SubagentRun {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        scheduled_item_id: row.get("scheduled_item_id")?,
        goal: row.get("goal")?,
        status: row.get("status")?,
        result: row.get("result")?,
        started_at: parse_ts(&started_at, "started_at")?,
        finished_at: parse_opt_ts(row.get("finished_at")?, "finished_at")?,
    })
}

impl Storage {
    /// Per-operation totals since `since`
    pub fn usage_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<UsageTotals>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT operation, COUNT(*), SUM(input_tokens), SUM(output_tokens) FROM cost_usage
             WHERE user_id = ?1 AND created_at >= ?2
             GROUP BY operation ORDER BY operation",
        )?;
        let rows = stmt.query_map(params![user_id, ts(since)], |row| {
            Ok(UsageTotals {
                operation: row.get(0)?,
                calls: row.get(1)?,
                input_tokens: row.get(2)?,
                output_tokens: row.get(3)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn start_subagent_run(&self, item: &ScheduledItem) -> Result<SubagentRun> {
        let run = SubagentRun {
            id: Uuid::new_v4().to_string(),
            user_id: item.user_id.clone(),
            scheduled_item_id: Some(item.id.clone()),
            goal: item.message.clone(),
            status: "running".to_string(),
            result: None,
            started_at: micros(Utc::now()),
            finished_at: None,
        };

        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO subagent_runs (id, user_id, scheduled_item_id, goal, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.id,
                run.user_id,
                run.scheduled_item_id,
                run.goal,
                run.status,
                ts(run.started_at)
            ],
        )?;
        Ok(run)
    }

    pub fn finish_subagent_run(&self, run_id: &str, success: bool, result: Option<&str>) -> Result<bool> {
        let status = if success { "succeeded" } else { "failed" };
        let writer = self.writer()?;
        let updated = writer.execute(
            "UPDATE subagent_runs SET status = ?1, result = ?2, finished_at = ?3
             WHERE id = ?4 AND status = 'running'",
            params![status, result, ts(Utc::now()), run_id],
        )?;
        Ok(updated > 0)
    }

    pub fn subagent_runs_for_item(&self, item_id: &str) -> Result<Vec<SubagentRun>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM subagent_runs WHERE scheduled_item_id = ?1 ORDER BY started_at",
        )?;
        let rows = stmt.query_map(params![item_id], row_to_run)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}
