//! Test Data Factory
//!
//! Seed data for journey tests:
//! - Linked memory chains the dream cycle can fuse
//! - Session summaries long enough to reflect on
//! - Batches of due nudges with unrelated wording

use chrono::{DateTime, Utc};
use hearth_core::{
    MemoryEntry, NewMemory, NewScheduledItem, RelationType, ScheduledItem, SessionSummary, Storage,
};

/// Operation names the scripted provider is keyed on
pub mod operations {
    pub const CLASSIFY: &str = "classify_facts";
    pub const NREM: &str = "nrem_fuse";
    pub const REM: &str = "rem_judge";
    pub const REFLECTION: &str = "reflection";
    pub const GAP_JUDGE: &str = "gap_judge";
}

/// Nudge texts sharing no words, so scheduler dedup leaves them alone
const DISTINCT_NUDGES: [&str; 12] = [
    "Water the basil",
    "Renew passport application",
    "Call grandma tonight",
    "Book dentist cleaning",
    "Return library novels",
    "Pay electricity invoice",
    "Stretch hamstrings",
    "Order printer toner",
    "Backup laptop photos",
    "Defrost freezer drawer",
    "Email landlord regarding heating",
    "Pick up dry cleaning",
];

/// Factory for seed data
pub struct TestDataFactory;

impl TestDataFactory {
    /// Insert memories linked head-to-tail with EXTENDS edges
    pub fn create_chain(storage: &Storage, user_id: &str, contents: &[&str]) -> Vec<MemoryEntry> {
        let memories: Vec<MemoryEntry> = contents
            .iter()
            .map(|c| storage.insert_memory(NewMemory::new(user_id, *c)).expect("insert memory"))
            .collect();
        for pair in memories.windows(2) {
            storage
                .add_relation(&pair[1].id, &pair[0].id, RelationType::Extends, 0.9)
                .expect("link memories");
        }
        memories
    }

    /// Save `count` session summaries of `messages` messages each
    pub fn create_sessions(storage: &Storage, user_id: &str, count: usize, messages: i64) {
        for i in 0..count {
            let summary = SessionSummary::new(user_id, format!("Planning session {} about the garden", i + 1), messages);
            storage.save_session_summary(&summary).expect("save summary");
        }
    }

    /// Insert `count` nudges due at `at`, bypassing engine dedup
    pub fn create_due_nudges(
        storage: &Storage,
        user_id: &str,
        count: usize,
        at: DateTime<Utc>,
    ) -> Vec<ScheduledItem> {
        DISTINCT_NUDGES
            .iter()
            .cycle()
            .take(count)
            .enumerate()
            .map(|(i, text)| {
                let message = if i < DISTINCT_NUDGES.len() {
                    text.to_string()
                } else {
                    format!("{} (round {})", text, i / DISTINCT_NUDGES.len() + 1)
                };
                storage
                    .insert_scheduled_item(NewScheduledItem::nudge(user_id, message, Some(at.timestamp())))
                    .expect("insert item")
            })
            .collect()
    }
}
