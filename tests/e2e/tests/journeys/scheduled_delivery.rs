//! Scheduled delivery journeys: claim, deliver, release, task results

use std::collections::HashSet;
use std::thread;

use chrono::{Duration, Utc};
use hearth_core::{AddOutcome, ExecutionStatus, NewScheduledItem};
use hearth_e2e_tests::{RecordingHandler, TestDataFactory, TestDatabaseManager};

#[test]
fn test_two_processes_never_claim_the_same_item() {
    let db = TestDatabaseManager::new_temp();
    let now = Utc::now();
    let seeded = TestDataFactory::create_due_nudges(&db.storage, "u", 24, now - Duration::minutes(1));

    let claimers: Vec<_> = [db.storage.clone(), db.open_another()]
        .into_iter()
        .map(|storage| {
            thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..10 {
                    for item in storage.claim_due_items(now.timestamp()).unwrap() {
                        ids.push(item.id);
                    }
                }
                ids
            })
        })
        .collect();

    let mut all = Vec::new();
    for claimer in claimers {
        all.extend(claimer.join().unwrap());
    }

    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), seeded.len(), "an item was claimed twice");
    assert_eq!(unique.len(), seeded.len());
    assert!(db.storage.get_due_items(now.timestamp()).unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_delivery_is_retried_next_pass() {
    let db = TestDatabaseManager::new_temp();
    let scheduler = db.scheduler();
    let now = Utc::now();
    let item = scheduler
        .add(NewScheduledItem::nudge("u", "Feed the cat", Some(now.timestamp() - 10)))
        .unwrap();

    let report = scheduler.run_due(now, &RecordingHandler::failing()).await.unwrap();
    assert_eq!(report.released, 1);
    let stored = db.storage.get_scheduled_item(item.item_id()).unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Pending);

    let handler = RecordingHandler::new();
    let report = scheduler.run_due(now, &handler).await.unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(handler.delivered(), vec![item.item_id().to_string()]);

    let stored = db.storage.get_scheduled_item(item.item_id()).unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Fired);
    assert!(stored.fired_at.is_some());
}

#[tokio::test]
async fn test_task_result_is_kept_on_the_item() {
    let db = TestDatabaseManager::new_temp();
    let scheduler = db.scheduler();
    let now = Utc::now();
    let AddOutcome::Created(task) = scheduler
        .add(NewScheduledItem::task(
            "u",
            "Compare train fares to Lyon",
            vec!["web_search".to_string()],
            Some(now.timestamp() - 1),
        ))
        .unwrap()
    else {
        panic!("task should be created");
    };

    let handler = RecordingHandler::new();
    scheduler.run_due(now, &handler).await.unwrap();
    assert_eq!(handler.tasks(), vec![task.id.clone()]);

    let stored = db.storage.get_scheduled_item(&task.id).unwrap().unwrap();
    assert_eq!(stored.result.as_deref(), Some("Done: Compare train fares to Lyon"));
    let runs = db.storage.subagent_runs_for_item(&task.id).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "succeeded");
}

#[test]
fn test_similar_pending_nudge_is_not_queued_twice() {
    let db = TestDatabaseManager::new_temp();
    let scheduler = db.scheduler();
    let first = scheduler
        .add(NewScheduledItem::nudge("u", "Call the plumber about the leak", None))
        .unwrap();
    let second = scheduler
        .add(NewScheduledItem::nudge("u", "call the plumber about the leak!", None))
        .unwrap();

    assert!(matches!(second, AddOutcome::Duplicate(ref id) if id == first.item_id()));
    assert_eq!(db.storage.list_scheduled_items("u", None).unwrap().len(), 1);
}
