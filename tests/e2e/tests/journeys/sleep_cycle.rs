//! Sleep tick journeys: dream, reflection and gap outreach together

use chrono::{Duration, Utc};
use hearth_core::{Dial, HearthConfig, LearnedFrom, MemoryFilter, NewMemory};
use hearth_e2e_tests::mocks::operations;
use hearth_e2e_tests::{TestDataFactory, TestDatabaseManager};
use serde_json::json;

fn learned_from(db: &TestDatabaseManager, source: LearnedFrom) -> Vec<String> {
    db.storage
        .list_memories(
            "u",
            &MemoryFilter {
                learned_from: Some(source),
                ..Default::default()
            },
        )
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect()
}

#[tokio::test]
async fn test_reflection_writes_guidelines_and_insights() {
    let db = TestDatabaseManager::new_temp();
    TestDataFactory::create_sessions(&db.storage, "u", 2, 5);
    db.provider.respond_json(
        operations::REFLECTION,
        json!({
            "insights": ["Plans the garden on weekends"],
            "guidelines": "- Offer seasonal planting tips"
        }),
    );

    let gardener = db.gardener();
    let report = gardener.sleep_tick(Utc::now()).await;
    assert!(report.failed.is_empty(), "failed stages: {:?}", report.failed);
    assert_eq!(report.reflections, 1);
    assert_eq!(learned_from(&db, LearnedFrom::SelfReflection), vec!["Plans the garden on weekends"]);

    let path = db.config.reflection.guidelines_path("u").unwrap();
    assert!(path.starts_with(db.workspace().join("u")));
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("seasonal planting"));

    // The next run sees the current document and replaces it
    db.provider
        .reset(operations::REFLECTION)
        .respond_json(
            operations::REFLECTION,
            json!({"insights": [], "guidelines": "- Ask which beds need watering"}),
        );
    gardener.sleep_tick(Utc::now()).await;
    let requests = db.provider.requests_for(operations::REFLECTION);
    assert!(requests[1].messages[0].content.contains("seasonal planting"));

    let rewritten = std::fs::read_to_string(&path).unwrap();
    assert!(rewritten.contains("watering"));
    assert!(!rewritten.contains("seasonal planting"));
}

#[tokio::test]
async fn test_short_sessions_are_not_reflected_on() {
    let db = TestDatabaseManager::new_temp();
    TestDataFactory::create_sessions(&db.storage, "u", 3, 2);

    let report = db.gardener().sleep_tick(Utc::now()).await;
    assert_eq!(report.reflections, 0);
    assert_eq!(db.provider.calls(operations::REFLECTION), 0);
    assert!(!db.config.reflection.guidelines_path("u").unwrap().exists());
}

#[tokio::test]
async fn test_reflection_failure_does_not_block_other_stages() {
    let db = TestDatabaseManager::new_temp();
    let now = Utc::now();
    TestDataFactory::create_chain(
        &db.storage,
        "u",
        &["Started sourdough baking", "Sourdough starter named Clint", "Bakes sourdough every Sunday"],
    );
    db.storage
        .insert_memory_at(NewMemory::new("u", "Run a half marathon").with_subject("goal"), now - Duration::days(20))
        .unwrap();
    TestDataFactory::create_sessions(&db.storage, "u", 2, 6);

    db.provider
        .respond_json(operations::NREM, json!({"summary": "Keen weekly sourdough baker", "importance": 5}))
        .fail(operations::REFLECTION)
        .respond_json(
            operations::GAP_JUDGE,
            json!([{"signal": 1, "decision": "nudge", "message": "How is marathon training going?"}]),
        );

    let report = db.gardener().sleep_tick(now).await;
    assert_eq!(report.failed, vec!["reflection"]);
    assert_eq!(report.fused, 1);
    assert_eq!(report.gap_items, 1);
    assert_eq!(learned_from(&db, LearnedFrom::NremConsolidation), vec!["Keen weekly sourdough baker"]);
    assert!(learned_from(&db, LearnedFrom::SelfReflection).is_empty());
}

#[tokio::test]
async fn test_gap_outreach_respects_daily_budget() {
    let mut config = HearthConfig::default();
    config.gaps.dial = Dial::Conservative;
    let db = TestDatabaseManager::with_config(config);
    let now = Utc::now();
    for goal in ["Learn conversational Italian", "Repaint the hallway", "Read more poetry"] {
        db.storage
            .insert_memory_at(NewMemory::new("u", goal).with_subject("goal"), now - Duration::days(14))
            .unwrap();
    }
    db.provider.respond_json(
        operations::GAP_JUDGE,
        json!([
            {"signal": 1, "decision": "nudge", "message": "Ciao! Any Italian practice lately?"},
            {"signal": 2, "decision": "nudge", "message": "Picked paint colours yet?"},
            {"signal": 3, "decision": "task", "message": "Find three short poems"},
        ]),
    );

    let gardener = db.gardener();
    assert_eq!(gardener.sleep_tick(now).await.gap_items, 1);
    assert_eq!(gardener.sleep_tick(now + Duration::hours(2)).await.gap_items, 0);
    assert_eq!(db.storage.list_scheduled_items("u", None).unwrap().len(), 1);
}
