//! Memory module - Core types and data structures
//!
//! Implements the assistant's long-term memory model with:
//! - Memory entries with prominence decay state and provenance
//! - Typed relations (UPDATES / EXTENDS / DERIVES) between entries
//! - Bi-temporal dates (when recorded vs when the event happens)

mod entry;
mod relation;

pub use entry::{MemoryEntry, MemoryFilter, MemoryStats, NewMemory};
pub use relation::{MemoryRelation, RelationDirection, RelationType};

use serde::{Deserialize, Serialize};

// ============================================================================
// CATEGORY
// ============================================================================

/// What kind of knowledge a memory holds
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    /// Likes, dislikes, habits
    Preference,
    /// A discrete statement about the world or the user
    #[default]
    Fact,
    /// Something that happened or will happen
    Event,
    /// People and how they relate to the user
    Relationship,
    /// Derived understanding (dream cycle, reflection)
    Insight,
}

impl MemoryCategory {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Preference => "preference",
            MemoryCategory::Fact => "fact",
            MemoryCategory::Event => "event",
            MemoryCategory::Relationship => "relationship",
            MemoryCategory::Insight => "insight",
        }
    }

    /// Parse from string name, unknown names fall back to `Fact`
    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "preference" => MemoryCategory::Preference,
            "event" => MemoryCategory::Event,
            "relationship" => MemoryCategory::Relationship,
            "insight" => MemoryCategory::Insight,
            _ => MemoryCategory::Fact,
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY TYPE
// ============================================================================

/// Lifecycle class of a memory
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Stable identity facts (name, birthday). Never decays.
    StaticProfile,
    /// Slowly changing profile facts (job, city)
    DynamicProfile,
    /// Ordinary extracted knowledge
    #[default]
    Regular,
    /// Output of consolidation or reflection
    Derived,
    /// Replaced by a newer memory or archived by decay. Kept for audit.
    Superseded,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::StaticProfile => "static_profile",
            MemoryType::DynamicProfile => "dynamic_profile",
            MemoryType::Regular => "regular",
            MemoryType::Derived => "derived",
            MemoryType::Superseded => "superseded",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "static_profile" => MemoryType::StaticProfile,
            "dynamic_profile" => MemoryType::DynamicProfile,
            "derived" => MemoryType::Derived,
            "superseded" => MemoryType::Superseded,
            _ => MemoryType::Regular,
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// SOURCE / PROVENANCE
// ============================================================================

/// Who stated the memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    #[default]
    User,
    Assistant,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::User => "user",
            MemorySource::Assistant => "assistant",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "assistant" => MemorySource::Assistant,
            _ => MemorySource::User,
        }
    }
}

/// How the memory was learned
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LearnedFrom {
    /// Extracted from a conversation turn
    #[default]
    Conversation,
    /// The user corrected an earlier statement
    Correction,
    /// Inferred (REM exploration, classifier)
    Inference,
    /// Produced by the periodic consolidation pass
    Consolidation,
    /// Produced by NREM cluster fusion during the dream cycle
    NremConsolidation,
    /// Produced by the self-reflection stage
    SelfReflection,
}

impl LearnedFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearnedFrom::Conversation => "conversation",
            LearnedFrom::Correction => "correction",
            LearnedFrom::Inference => "inference",
            LearnedFrom::Consolidation => "consolidation",
            LearnedFrom::NremConsolidation => "nrem_consolidation",
            LearnedFrom::SelfReflection => "self_reflection",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "correction" => LearnedFrom::Correction,
            "inference" => LearnedFrom::Inference,
            "consolidation" => LearnedFrom::Consolidation,
            "nrem_consolidation" => LearnedFrom::NremConsolidation,
            "self_reflection" => LearnedFrom::SelfReflection,
            _ => LearnedFrom::Conversation,
        }
    }
}

impl std::fmt::Display for LearnedFrom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// IMPORTANCE
// ============================================================================

/// Default importance for ordinary memories
pub const DEFAULT_IMPORTANCE: u8 = 5;

/// Importance seeded for identity-class memories so they resist decay
pub const IDENTITY_IMPORTANCE: u8 = 8;

/// Subjects treated as identity-class regardless of category
const IDENTITY_SUBJECTS: &[&str] = &["personal", "location", "identity", "family"];

/// Seed importance for a new memory from its category and subject
pub fn seed_importance(category: MemoryCategory, subject: Option<&str>) -> u8 {
    if category == MemoryCategory::Relationship {
        return IDENTITY_IMPORTANCE;
    }
    match subject {
        Some(s) if IDENTITY_SUBJECTS.contains(&s.trim().to_lowercase().as_str()) => {
            IDENTITY_IMPORTANCE
        }
        _ => DEFAULT_IMPORTANCE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_roundtrip_names() {
        for c in [
            MemoryCategory::Preference,
            MemoryCategory::Fact,
            MemoryCategory::Event,
            MemoryCategory::Relationship,
            MemoryCategory::Insight,
        ] {
            assert_eq!(MemoryCategory::parse_name(c.as_str()), c);
        }
        assert_eq!(MemoryCategory::parse_name("nonsense"), MemoryCategory::Fact);
    }

    #[test]
    fn test_identity_importance() {
        assert_eq!(seed_importance(MemoryCategory::Relationship, None), 8);
        assert_eq!(seed_importance(MemoryCategory::Fact, Some("Location")), 8);
        assert_eq!(seed_importance(MemoryCategory::Fact, Some("personal")), 8);
        assert_eq!(seed_importance(MemoryCategory::Fact, Some("work")), 5);
        assert_eq!(seed_importance(MemoryCategory::Preference, None), 5);
    }

    #[test]
    fn test_learned_from_names() {
        assert_eq!(LearnedFrom::NremConsolidation.as_str(), "nrem_consolidation");
        assert_eq!(
            LearnedFrom::parse_name("self_reflection"),
            LearnedFrom::SelfReflection
        );
    }
}
