//! Execution status and board projection
//!
//! Execution status moves through one canonical transition function. Board
//! status is never written independently: it is projected from the execution
//! status, trigger presence and the user-set hold lane on every write.

use serde::{Deserialize, Serialize};

/// Execution lifecycle of a scheduled item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Fired,
    Dismissed,
    Expired,
    Acted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Processing => "processing",
            ExecutionStatus::Fired => "fired",
            ExecutionStatus::Dismissed => "dismissed",
            ExecutionStatus::Expired => "expired",
            ExecutionStatus::Acted => "acted",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "processing" => Some(ExecutionStatus::Processing),
            "fired" => Some(ExecutionStatus::Fired),
            "dismissed" => Some(ExecutionStatus::Dismissed),
            "expired" => Some(ExecutionStatus::Expired),
            "acted" => Some(ExecutionStatus::Acted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Fired
                | ExecutionStatus::Dismissed
                | ExecutionStatus::Expired
                | ExecutionStatus::Acted
        )
    }

    /// Terminal statuses, for SQL `IN` lists
    pub const TERMINAL: [ExecutionStatus; 4] = [
        ExecutionStatus::Fired,
        ExecutionStatus::Dismissed,
        ExecutionStatus::Expired,
        ExecutionStatus::Acted,
    ];
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kanban lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardStatus {
    Inbox,
    Backlog,
    Scheduled,
    InProgress,
    Waiting,
    Done,
    Archived,
}

impl BoardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardStatus::Inbox => "inbox",
            BoardStatus::Backlog => "backlog",
            BoardStatus::Scheduled => "scheduled",
            BoardStatus::InProgress => "in_progress",
            BoardStatus::Waiting => "waiting",
            BoardStatus::Done => "done",
            BoardStatus::Archived => "archived",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "inbox" => Some(BoardStatus::Inbox),
            "backlog" => Some(BoardStatus::Backlog),
            "scheduled" => Some(BoardStatus::Scheduled),
            "in_progress" => Some(BoardStatus::InProgress),
            "waiting" => Some(BoardStatus::Waiting),
            "done" => Some(BoardStatus::Done),
            "archived" => Some(BoardStatus::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for BoardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// User-set lane for a pending item. Ignored once the item leaves pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardHold {
    Backlog,
    Waiting,
}

impl BoardHold {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardHold::Backlog => "backlog",
            BoardHold::Waiting => "waiting",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "backlog" => Some(BoardHold::Backlog),
            "waiting" => Some(BoardHold::Waiting),
            _ => None,
        }
    }
}

/// Something that happens to an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemEvent {
    /// Scheduler took ownership
    Claim,
    /// Post-claim processing failed, hand the item back
    Release,
    /// Delivered
    Fire,
    Dismiss,
    Expire,
    /// The user (or a sub-agent) acted on it
    Act,
}

/// Canonical execution transition. `None` when the event is not allowed
/// from `from`; terminal statuses accept nothing.
pub fn transition(from: ExecutionStatus, event: ItemEvent) -> Option<ExecutionStatus> {
    use ExecutionStatus::*;
    match (from, event) {
        (Pending, ItemEvent::Claim) => Some(Processing),
        (Processing, ItemEvent::Release) => Some(Pending),
        (Pending | Processing, ItemEvent::Fire) => Some(Fired),
        (Pending | Processing, ItemEvent::Dismiss) => Some(Dismissed),
        (Pending | Processing, ItemEvent::Expire) => Some(Expired),
        (Pending | Processing, ItemEvent::Act) => Some(Acted),
        _ => None,
    }
}

/// Board lane as a pure function of execution status, trigger presence and
/// the hold lane
pub fn project_board(
    status: ExecutionStatus,
    trigger_at: Option<i64>,
    hold: Option<BoardHold>,
) -> BoardStatus {
    match status {
        ExecutionStatus::Processing => BoardStatus::InProgress,
        ExecutionStatus::Fired | ExecutionStatus::Acted => BoardStatus::Done,
        ExecutionStatus::Dismissed | ExecutionStatus::Expired => BoardStatus::Archived,
        ExecutionStatus::Pending => match (hold, trigger_at) {
            (Some(BoardHold::Backlog), _) => BoardStatus::Backlog,
            (Some(BoardHold::Waiting), _) => BoardStatus::Waiting,
            (None, None) => BoardStatus::Inbox,
            (None, Some(_)) => BoardStatus::Scheduled,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    const EVENTS: [ItemEvent; 6] = [
        ItemEvent::Claim,
        ItemEvent::Release,
        ItemEvent::Fire,
        ItemEvent::Dismiss,
        ItemEvent::Expire,
        ItemEvent::Act,
    ];

    #[test]
    fn test_claim_only_from_pending() {
        assert_eq!(transition(Pending, ItemEvent::Claim), Some(Processing));
        for status in [Processing, Fired, Dismissed, Expired, Acted] {
            assert_eq!(transition(status, ItemEvent::Claim), None);
        }
    }

    #[test]
    fn test_release_returns_to_pending() {
        assert_eq!(transition(Processing, ItemEvent::Release), Some(Pending));
        assert_eq!(transition(Pending, ItemEvent::Release), None);
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        for status in ExecutionStatus::TERMINAL {
            assert!(status.is_terminal());
            for event in EVENTS {
                assert_eq!(transition(status, event), None, "{status} accepted {event:?}");
            }
        }
    }

    #[test]
    fn test_board_projection() {
        assert_eq!(project_board(Pending, None, None), BoardStatus::Inbox);
        assert_eq!(project_board(Pending, Some(1), None), BoardStatus::Scheduled);
        assert_eq!(
            project_board(Pending, Some(1), Some(BoardHold::Waiting)),
            BoardStatus::Waiting
        );
        assert_eq!(
            project_board(Pending, None, Some(BoardHold::Backlog)),
            BoardStatus::Backlog
        );
        assert_eq!(project_board(Processing, Some(1), None), BoardStatus::InProgress);
        assert_eq!(project_board(Fired, Some(1), None), BoardStatus::Done);
        assert_eq!(project_board(Acted, None, None), BoardStatus::Done);
        assert_eq!(project_board(Dismissed, Some(1), None), BoardStatus::Archived);
        assert_eq!(project_board(Expired, Some(1), None), BoardStatus::Archived);
    }

    #[test]
    fn test_hold_ignored_outside_pending() {
        for status in [Processing, Fired, Dismissed, Expired, Acted] {
            assert_eq!(
                project_board(status, Some(1), Some(BoardHold::Backlog)),
                project_board(status, Some(1), None)
            );
        }
    }

    #[test]
    fn test_names_round_trip() {
        for status in [Pending, Processing, Fired, Dismissed, Expired, Acted] {
            assert_eq!(ExecutionStatus::parse_name(status.as_str()), Some(status));
        }
        assert_eq!(BoardStatus::parse_name("in_progress"), Some(BoardStatus::InProgress));
        assert_eq!(BoardHold::parse_name("nope"), None);
    }
}
