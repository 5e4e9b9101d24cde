//! Scheduler-to-store scenarios exercised through the public API

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use libsyndicast::platforms::mock::MockPlatform;
use libsyndicast::sanitizer::MarkupDialect;
use libsyndicast::{
    Config, ContentItem, ContentStatus, Database, ErrorKind, PlatformError, PlatformKind,
    PlatformRegistry, PublicationStatus, Scheduler,
};
use tempfile::TempDir;

async fn setup() -> (TempDir, Arc<Database>) {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("content.db");
    let db = Arc::new(Database::new(&db_path.to_string_lossy()).await.unwrap());
    (temp, db)
}

fn registry(platforms: &[&MockPlatform]) -> PlatformRegistry {
    let mut registry = PlatformRegistry::new();
    for platform in platforms {
        registry.register(Arc::new((*platform).clone()));
    }
    registry
}

fn scheduler(db: &Arc<Database>, platforms: &[&MockPlatform], holder: &str) -> Scheduler {
    Scheduler::new(db.clone(), registry(platforms), &Config::default_config()).with_holder_id(holder)
}

fn past() -> i64 {
    chrono::Utc::now().timestamp() - 30
}

fn item(targets: &[PlatformKind]) -> ContentItem {
    ContentItem::new(
        "<h2>Weekly digest</h2><p>Read it <a href=\"https://example.com/digest\">here</a></p>",
        targets.iter().copied(),
        past(),
    )
}

fn vk() -> MockPlatform {
    MockPlatform::success(PlatformKind::Vk).with_dialect(MarkupDialect::PLAIN_TEXT)
}

#[tokio::test]
async fn test_partial_publication_and_idempotent_rerun() {
    let (_temp, db) = setup().await;
    let telegram = MockPlatform::success(PlatformKind::Telegram);
    let vk = vk();
    vk.push_outcomes([Err(PlatformError::Authentication("token revoked".to_string()))]);

    let content = item(&[PlatformKind::Telegram, PlatformKind::Vk]);
    db.create_item(&content).await.unwrap();
    let scheduler = scheduler(&db, &[&telegram, &vk], "worker-a");

    scheduler.tick().await.unwrap();

    let stored = db.get_item(&content.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ContentStatus::Partial);
    let telegram_record = stored.platform_state[&PlatformKind::Telegram].clone();
    assert!(telegram_record.is_complete());
    let vk_error = stored.platform_state[&PlatformKind::Vk].error.clone().unwrap();
    assert_eq!(vk_error.kind, ErrorKind::Auth);
    assert!(!vk_error.retryable);

    // Auth failures are not retried on their own
    assert_eq!(scheduler.tick().await.unwrap().due, 0);

    // Rescheduling retries VK without touching the published Telegram post
    let targets: BTreeSet<_> = [PlatformKind::Telegram, PlatformKind::Vk].into_iter().collect();
    db.reschedule_item(&content.id, &targets, past()).await.unwrap();
    scheduler.tick().await.unwrap();

    let stored = db.get_item(&content.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ContentStatus::Published);
    assert_eq!(stored.platform_state[&PlatformKind::Telegram], telegram_record);
    assert_eq!(telegram.call_count(), 1);
    assert_eq!(vk.call_count(), 2);
    assert_eq!(
        vk.calls()[1].payload,
        "Weekly digest\nRead it here (https://example.com/digest)"
    );
}

#[tokio::test]
async fn test_reschedule_replaces_platform_state() {
    let (_temp, db) = setup().await;
    let telegram = MockPlatform::success(PlatformKind::Telegram);
    telegram.push_outcomes([Err(PlatformError::Network("connection reset".to_string()))]);
    let vk = vk();

    let content = item(&[PlatformKind::Telegram, PlatformKind::Vk]);
    db.create_item(&content).await.unwrap();
    let scheduler = scheduler(&db, &[&telegram, &vk], "worker-a");

    scheduler.tick().await.unwrap();
    let stored = db.get_item(&content.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ContentStatus::Partial);
    assert!(stored.platform_state[&PlatformKind::Vk].is_complete());
    assert!(stored.next_attempt_at.is_some());

    let only_telegram: BTreeSet<_> = [PlatformKind::Telegram].into_iter().collect();
    let rescheduled = db
        .reschedule_item(&content.id, &only_telegram, past())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rescheduled.status, ContentStatus::Scheduled);
    assert_eq!(rescheduled.next_attempt_at, None);

    scheduler.tick().await.unwrap();

    let stored = db.get_item(&content.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ContentStatus::Published);
    assert_eq!(stored.targets, only_telegram);
    assert_eq!(
        stored.platform_state.keys().copied().collect::<Vec<_>>(),
        vec![PlatformKind::Telegram]
    );
    assert_eq!(
        stored.platform_state[&PlatformKind::Telegram].status,
        PublicationStatus::Published
    );
    assert_eq!(vk.call_count(), 1);
}

#[tokio::test]
async fn test_two_schedulers_never_duplicate() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("content.db").to_string_lossy().to_string();

    // Separate pools stand in for separate daemon processes
    let db_a = Arc::new(Database::new(&db_path).await.unwrap());
    let db_b = Arc::new(Database::new(&db_path).await.unwrap());

    let telegram = MockPlatform::with_delay(PlatformKind::Telegram, Duration::from_millis(100));
    let mut ids = Vec::new();
    for _ in 0..6 {
        let content = item(&[PlatformKind::Telegram]);
        db_a.create_item(&content).await.unwrap();
        ids.push(content.id);
    }

    let a = scheduler(&db_a, &[&telegram], "worker-a");
    let b = scheduler(&db_b, &[&telegram], "worker-b");

    let (report_a, report_b) = tokio::join!(a.tick(), b.tick());
    let (report_a, report_b) = (report_a.unwrap(), report_b.unwrap());

    assert_eq!(report_a.errors + report_b.errors, 0);
    assert_eq!(telegram.call_count(), 6);
    for id in &ids {
        let stored = db_a.get_item(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ContentStatus::Published);
        assert_eq!(stored.platform_state[&PlatformKind::Telegram].attempts, 1);
    }
}

#[tokio::test]
async fn test_item_deleted_mid_run_is_not_resurrected() {
    let (_temp, db) = setup().await;
    let telegram = MockPlatform::with_delay(PlatformKind::Telegram, Duration::from_millis(300));
    let content = item(&[PlatformKind::Telegram]);
    db.create_item(&content).await.unwrap();

    let scheduler = Arc::new(scheduler(&db, &[&telegram], "worker-a"));
    let tick = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.tick().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(db.delete_item(&content.id).await.unwrap());

    let report = tick.await.unwrap().unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(telegram.call_count(), 1);
    assert!(db.get_item(&content.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_item_without_targets_fails_without_calls() {
    let (_temp, db) = setup().await;
    let telegram = MockPlatform::success(PlatformKind::Telegram);
    let content = item(&[]);
    db.create_item(&content).await.unwrap();

    scheduler(&db, &[&telegram], "worker-a").tick().await.unwrap();

    let stored = db.get_item(&content.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ContentStatus::Failed);
    assert_eq!(telegram.call_count(), 0);
}
