//! Typed relations between memories

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of relationship between two memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelationType {
    /// Source replaces target. Target is marked superseded, never deleted.
    Updates,
    /// Source complements target
    Extends,
    /// Source was produced from target (consolidation output -> input)
    Derives,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Updates => "UPDATES",
            RelationType::Extends => "EXTENDS",
            RelationType::Derives => "DERIVES",
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "UPDATES" => Ok(RelationType::Updates),
            "EXTENDS" => Ok(RelationType::Extends),
            "DERIVES" => Ok(RelationType::Derives),
            _ => Err(format!("Unknown relation type: {}", s)),
        }
    }
}

/// A directed edge between two memories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRelation {
    pub source_id: String,
    pub target_id: String,
    pub relation_type: RelationType,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// Which edges to return for a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationDirection {
    /// Edges where the memory is the target
    Incoming,
    /// Edges where the memory is the source
    Outgoing,
    Both,
}
