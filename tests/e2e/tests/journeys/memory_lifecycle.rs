//! Memory lifecycle: store, reinforce, forget, decay, prune

use chrono::{Duration, Utc};
use hearth_core::decay::DecayEngine;
use hearth_core::{
    ExecutionStatus, FactCandidate, MemoryFilter, MemoryType, NewMemory, NewScheduledItem,
};
use hearth_e2e_tests::TestDatabaseManager;

#[tokio::test]
async fn test_restated_fact_reinforces_single_row() {
    let db = TestDatabaseManager::new_temp();
    let pipeline = db.pipeline();

    let first = pipeline
        .process("u", vec![FactCandidate::fact("Vegetarian since 2019")])
        .await;
    assert_eq!(first.stored.len(), 1);
    let before = db.storage.get_memory(&first.stored[0]).unwrap().unwrap();

    let again = pipeline
        .process("u", vec![FactCandidate::fact("vegetarian since 2019")])
        .await;
    assert!(again.stored.is_empty());
    assert_eq!(again.reinforced, first.stored);

    let after = db.storage.get_memory(&first.stored[0]).unwrap().unwrap();
    assert_eq!(after.times_confirmed, before.times_confirmed + 1);
    assert!(after.confidence >= before.confidence);
    assert_eq!(db.storage.memory_stats("u").unwrap().total, 1);
}

#[tokio::test]
async fn test_forgetting_a_fact_expires_its_reminders() {
    let db = TestDatabaseManager::new_temp();
    let pipeline = db.pipeline();

    let stored = pipeline
        .process("u", vec![FactCandidate::fact("Sister visiting in June")])
        .await;
    let memory_id = stored.stored[0].clone();
    let reminder = db
        .storage
        .insert_scheduled_item(
            NewScheduledItem::nudge("u", "Tidy the guest room", Some(Utc::now().timestamp() + 3600))
                .with_source_memory(&memory_id),
        )
        .unwrap();

    let outcome = pipeline
        .process("u", vec![FactCandidate::forget("sister visiting in june")])
        .await;
    assert_eq!(outcome.forgotten, vec![memory_id.clone()]);
    assert!(db.storage.get_memory(&memory_id).unwrap().is_none());

    let reminder = db.storage.get_scheduled_item(&reminder.id).unwrap().unwrap();
    assert_eq!(reminder.status, ExecutionStatus::Expired);
}

#[test]
fn test_decay_archives_then_prune_deletes() {
    let db = TestDatabaseManager::new_temp();
    let engine = DecayEngine::new(db.config.decay.clone());
    let fading = db.storage.insert_memory(NewMemory::new("u", "Tried a new bakery once")).unwrap();
    let pinned = db
        .storage
        .insert_memory(NewMemory::new("u", "Name is Robin").with_type(MemoryType::StaticProfile))
        .unwrap();

    let later = Utc::now() + Duration::days(400);
    let report = db.storage.apply_decay(&engine, later).unwrap();
    assert_eq!(report.archived, 1);

    let archived = db.storage.get_memory(&fading.id).unwrap().unwrap();
    assert!(!archived.is_latest);
    assert!(archived.prominence < 0.15);

    // Archived rows stay out of default listings
    let visible = db.storage.list_memories("u", &MemoryFilter::default()).unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, pinned.id);

    assert_eq!(db.storage.prune_decayed(&engine, later).unwrap(), 1);
    assert!(db.storage.get_memory(&fading.id).unwrap().is_none());
    let kept = db.storage.get_memory(&pinned.id).unwrap().unwrap();
    assert_eq!(kept.prominence, 1.0);
}
