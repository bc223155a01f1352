//! Scheduled items and recurrence

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::state::{BoardHold, BoardStatus, ExecutionStatus};

// ============================================================================
// ENUMS
// ============================================================================

/// Who created the item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemSource {
    User,
    #[default]
    Agent,
}

impl ItemSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemSource::User => "user",
            ItemSource::Agent => "agent",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "user" => ItemSource::User,
            _ => ItemSource::Agent,
        }
    }
}

/// Nudge: deliver a pre-written message. Task: run a sub-agent on a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    #[default]
    Nudge,
    Task,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Nudge => "nudge",
            ItemKind::Task => "task",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "task" => ItemKind::Task,
            _ => ItemKind::Nudge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    #[default]
    Reminder,
    EventPrep,
    CommitmentCheck,
    GoalCheckin,
    FollowUp,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Reminder => "reminder",
            ItemType::EventPrep => "event_prep",
            ItemType::CommitmentCheck => "commitment_check",
            ItemType::GoalCheckin => "goal_checkin",
            ItemType::FollowUp => "follow_up",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "event_prep" => ItemType::EventPrep,
            "commitment_check" => ItemType::CommitmentCheck,
            "goal_checkin" => ItemType::GoalCheckin,
            "follow_up" => ItemType::FollowUp,
            _ => ItemType::Reminder,
        }
    }
}

// ============================================================================
// RECURRENCE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrencePattern {
    Daily,
    Weekly,
    Weekdays,
    Weekends,
}

/// Recurrence rule, evaluated in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recurrence {
    pub pattern: RecurrencePattern,
    pub hour: u32,
    pub minute: u32,
    /// Days from Sunday (0-6), weekly only. Defaults to the weekday of the
    /// reference time.
    #[serde(default)]
    pub day_of_week: Option<u32>,
}

impl Recurrence {
    pub fn daily(hour: u32, minute: u32) -> Self {
        Self {
            pattern: RecurrencePattern::Daily,
            hour,
            minute,
            day_of_week: None,
        }
    }

    pub fn weekly(day_of_week: u32, hour: u32, minute: u32) -> Self {
        Self {
            pattern: RecurrencePattern::Weekly,
            hour,
            minute,
            day_of_week: Some(day_of_week % 7),
        }
    }

    pub fn weekdays(hour: u32, minute: u32) -> Self {
        Self {
            pattern: RecurrencePattern::Weekdays,
            hour,
            minute,
            day_of_week: None,
        }
    }

    pub fn weekends(hour: u32, minute: u32) -> Self {
        Self {
            pattern: RecurrencePattern::Weekends,
            hour,
            minute,
            day_of_week: None,
        }
    }

    fn matches_day(&self, day: Weekday, reference: Weekday) -> bool {
        match self.pattern {
            RecurrencePattern::Daily => true,
            RecurrencePattern::Weekdays => !matches!(day, Weekday::Sat | Weekday::Sun),
            RecurrencePattern::Weekends => matches!(day, Weekday::Sat | Weekday::Sun),
            RecurrencePattern::Weekly => {
                let target = self
                    .day_of_week
                    .unwrap_or_else(|| reference.num_days_from_sunday());
                day.num_days_from_sunday() == target % 7
            }
        }
    }

    /// First occurrence strictly after `from`
    pub fn next_occurrence(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        // Default to midnight if invalid time
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN);
        let today = from.date_naive();

        for offset in 0..=7 {
            let date = today + Duration::days(offset);
            let candidate = Utc.from_utc_datetime(&date.and_time(time));
            if candidate > from && self.matches_day(candidate.weekday(), from.weekday()) {
                return candidate;
            }
        }
        from + Duration::days(1) // Fallback
    }

    /// Next trigger as epoch seconds
    pub fn next_trigger(&self, after: i64) -> i64 {
        let from = DateTime::<Utc>::from_timestamp(after, 0).unwrap_or_else(Utc::now);
        self.next_occurrence(from).timestamp()
    }
}

// ============================================================================
// ITEM
// ============================================================================

/// A unit of future work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledItem {
    pub id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub source: ItemSource,
    pub kind: ItemKind,
    pub item_type: ItemType,
    /// Nudge text, or the goal of a task
    pub message: String,
    pub context: Option<serde_json::Value>,
    /// Tools a task's sub-agent may use
    pub allowed_tools: Vec<String>,
    /// UTC epoch seconds. None = unscheduled (inbox).
    pub trigger_at: Option<i64>,
    pub recurrence: Option<Recurrence>,
    pub status: ExecutionStatus,
    pub board_status: BoardStatus,
    pub board_hold: Option<BoardHold>,
    pub priority: i32,
    pub labels: Vec<String>,
    pub depends_on: Vec<String>,
    pub goal_id: Option<String>,
    pub result: Option<String>,
    /// Memory this item was derived from (cascade expiry on delete)
    pub source_memory_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fired_at: Option<DateTime<Utc>>,
}

impl ScheduledItem {
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.status == ExecutionStatus::Pending && self.trigger_at.is_some_and(|t| t <= now)
    }
}

/// Input for creating a scheduled item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewScheduledItem {
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub source: ItemSource,
    #[serde(default)]
    pub kind: ItemKind,
    #[serde(default)]
    pub item_type: ItemType,
    pub message: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub trigger_at: Option<i64>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    #[serde(default)]
    pub board_hold: Option<BoardHold>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub goal_id: Option<String>,
    #[serde(default)]
    pub source_memory_id: Option<String>,
}

impl NewScheduledItem {
    /// A nudge delivering `message` at `trigger_at`
    pub fn nudge(user_id: &str, message: impl Into<String>, trigger_at: Option<i64>) -> Self {
        Self {
            user_id: user_id.to_string(),
            session_id: None,
            source: ItemSource::Agent,
            kind: ItemKind::Nudge,
            item_type: ItemType::Reminder,
            message: message.into(),
            context: None,
            allowed_tools: Vec::new(),
            trigger_at,
            recurrence: None,
            board_hold: None,
            priority: 0,
            labels: Vec::new(),
            depends_on: Vec::new(),
            goal_id: None,
            source_memory_id: None,
        }
    }

    /// A sub-agent task pursuing `goal` with the given tools
    pub fn task(
        user_id: &str,
        goal: impl Into<String>,
        allowed_tools: Vec<String>,
        trigger_at: Option<i64>,
    ) -> Self {
        Self {
            kind: ItemKind::Task,
            allowed_tools,
            ..Self::nudge(user_id, goal, trigger_at)
        }
    }

    pub fn with_source(mut self, source: ItemSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_type(mut self, item_type: ItemType) -> Self {
        self.item_type = item_type;
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn with_hold(mut self, hold: BoardHold) -> Self {
        self.board_hold = Some(hold);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_goal(mut self, goal_id: &str) -> Self {
        self.goal_id = Some(goal_id.to_string());
        self
    }

    pub fn with_source_memory(mut self, memory_id: &str) -> Self {
        self.source_memory_id = Some(memory_id.to_string());
        self
    }
}

/// Partial update of the user-editable board fields. `None` leaves a field
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct BoardUpdate {
    /// `Some(None)` clears the hold lane
    pub hold: Option<Option<BoardHold>>,
    pub priority: Option<i32>,
    pub labels: Option<Vec<String>>,
    pub depends_on: Option<Vec<String>>,
    pub goal_id: Option<Option<String>>,
}
