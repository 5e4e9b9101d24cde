//! Integration tests for the syndi-send daemon

use assert_cmd::Command;
use libsyndicast::{ContentItem, ContentStatus, Database, ErrorKind, MediaRef, PlatformKind};
use predicates::prelude::*;
use serde_json::json;
use std::fs;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestEnv {
    dir: TempDir,
    config_path: String,
    db_path: String,
}

/// Write a config with `extra` appended and initialize the database
async fn setup_test_env(extra: &str) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.toml");
    let db_path = dir.path().join("content.db");

    let config_content = format!(
        r#"
[database]
path = "{}"

[scheduling]
poll_interval = 1
max_retries = 3
retry_delay = 1

[scheduling.rate_limits.telegram]
posts_per_hour = 100
{}
"#,
        db_path.display().to_string().replace('\\', "/"),
        extra
    );
    fs::write(&config_path, config_content).unwrap();

    Database::new(db_path.to_str().unwrap()).await.unwrap();

    TestEnv {
        config_path: config_path.to_str().unwrap().to_string(),
        db_path: db_path.to_str().unwrap().to_string(),
        dir,
    }
}

async fn create_due_item(db_path: &str, targets: &[PlatformKind]) -> String {
    let db = Database::new(db_path).await.unwrap();
    let item = ContentItem::new(
        "<p>Launch <b>today</b></p>",
        targets.iter().copied(),
        chrono::Utc::now().timestamp() - 10,
    );
    db.create_item(&item).await.unwrap();
    item.id
}

fn daemon(env: &TestEnv) -> Command {
    let mut cmd = Command::cargo_bin("syndi-send").unwrap();
    cmd.env("SYNDICAST_CONFIG", &env.config_path)
        .env_remove("SYNDICAST_LOG_FORMAT")
        .env_remove("RUST_LOG");
    cmd
}

// BASIC FUNCTIONALITY TESTS

#[tokio::test]
async fn test_once_flag_exits_immediately() {
    let env = setup_test_env("").await;

    daemon(&env)
        .arg("--once")
        .assert()
        .success()
        .stderr(predicate::str::contains("syndi-send daemon starting"))
        .stderr(predicate::str::contains("processed due content once, exiting"))
        .stderr(predicate::str::contains("syndi-send daemon stopped"));
}

#[tokio::test]
async fn test_invalid_config_exits_with_config_code() {
    let dir = TempDir::new().unwrap();
    let invalid_config = dir.path().join("invalid.toml");
    fs::write(&invalid_config, "invalid toml content [[[").unwrap();

    Command::cargo_bin("syndi-send")
        .unwrap()
        .env("SYNDICAST_CONFIG", invalid_config.to_str().unwrap())
        .arg("--once")
        .assert()
        .code(2);
}

#[tokio::test]
async fn test_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    let nonexistent = dir.path().join("nonexistent.toml");

    Command::cargo_bin("syndi-send")
        .unwrap()
        .env("SYNDICAST_CONFIG", nonexistent.to_str().unwrap())
        .arg("--once")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[tokio::test]
async fn test_custom_poll_interval() {
    let env = setup_test_env("").await;

    daemon(&env)
        .args(["--once", "--poll-interval", "30s"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Poll interval: 30s"));
}

#[tokio::test]
async fn test_rejects_malformed_poll_interval() {
    let env = setup_test_env("").await;

    daemon(&env)
        .args(["--once", "--poll-interval", "soon"])
        .assert()
        .failure();
}

#[tokio::test]
async fn test_json_log_format() {
    let env = setup_test_env("").await;

    daemon(&env)
        .args(["--once", "--log-format", "json"])
        .assert()
        .success()
        .stderr(predicate::str::contains(r#""message":"syndi-send daemon starting""#));
}

#[tokio::test]
async fn test_scheduling_disabled_does_nothing() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.toml");
    let db_path = dir.path().join("content.db");
    fs::write(
        &config_path,
        format!(
            "[database]\npath = \"{}\"\n\n[scheduling]\nenabled = false\n",
            db_path.display().to_string().replace('\\', "/")
        ),
    )
    .unwrap();
    let id = create_due_item(db_path.to_str().unwrap(), &[PlatformKind::Telegram]).await;

    Command::cargo_bin("syndi-send")
        .unwrap()
        .env("SYNDICAST_CONFIG", config_path.to_str().unwrap())
        .arg("--once")
        .assert()
        .success()
        .stderr(predicate::str::contains("Scheduling is disabled"));

    let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
    let item = db.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ContentStatus::Scheduled);
}

// PUBLISHING TESTS

#[tokio::test]
async fn test_unconfigured_platform_marked_failed() {
    let env = setup_test_env("").await;
    let id = create_due_item(&env.db_path, &[PlatformKind::Vk]).await;

    daemon(&env)
        .arg("--once")
        .assert()
        .success()
        .stderr(predicate::str::contains("Found content due for publishing"));

    let db = Database::new(&env.db_path).await.unwrap();
    let item = db.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ContentStatus::Failed);
    let error = item.platform_state[&PlatformKind::Vk].error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::NotConfigured);
    assert!(!error.retryable);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_publishes_to_telegram() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botintegration-token/sendMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": { "message_id": 77, "chat": { "id": -1001, "username": "launches" } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let token_file = dir.path().join("telegram.token");
    fs::write(&token_file, "integration-token\n").unwrap();

    let env = setup_test_env(&format!(
        r#"
[telegram]
enabled = true
token_file = "{}"
chat_id = "@launches"
api_base = "{}"
"#,
        token_file.display().to_string().replace('\\', "/"),
        server.uri()
    ))
    .await;
    let id = create_due_item(&env.db_path, &[PlatformKind::Telegram]).await;

    daemon(&env).arg("--once").assert().success();

    let db = Database::new(&env.db_path).await.unwrap();
    let item = db.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ContentStatus::Published);
    assert_eq!(
        item.platform_state[&PlatformKind::Telegram].post_url.as_deref(),
        Some("https://t.me/launches/77")
    );

    // A second run finds nothing due and makes no further calls
    daemon(&env).arg("--once").assert().success();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["text"], "Launch <b>today</b>");
    assert_eq!(body["parse_mode"], "HTML");

    drop(env.dir);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_media_not_reposted_when_follow_up_text_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botintegration-token/sendPhoto"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": { "message_id": 80, "chat": { "id": -1001, "username": "launches" } }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botintegration-token/sendMessage"))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let token_file = dir.path().join("telegram.token");
    fs::write(&token_file, "integration-token\n").unwrap();

    let env = setup_test_env(&format!(
        r#"
[telegram]
enabled = true
token_file = "{}"
chat_id = "@launches"
api_base = "{}"
caption_limit = 5
"#,
        token_file.display().to_string().replace('\\', "/"),
        server.uri()
    ))
    .await;

    let db = Database::new(&env.db_path).await.unwrap();
    let item = ContentItem::new(
        "<p>Launch <b>today</b></p>",
        [PlatformKind::Telegram],
        chrono::Utc::now().timestamp() - 10,
    )
    .with_media([MediaRef::new("https://cdn.example.com/launch.jpg")]);
    db.create_item(&item).await.unwrap();

    daemon(&env).arg("--once").assert().success();
    // Past the configured retry delay, so a retryable failure would be due again
    std::thread::sleep(std::time::Duration::from_millis(1500));
    daemon(&env).arg("--once").assert().success();

    let stored = db.get_item(&item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ContentStatus::Failed);
    let error = stored.platform_state[&PlatformKind::Telegram].error.clone().unwrap();
    assert!(!error.retryable);
    assert!(error.message.contains("https://t.me/launches/80"));

    let photos = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().ends_with("/sendPhoto"))
        .count();
    assert_eq!(photos, 1);

    drop(env.dir);
}

#[tokio::test]
async fn test_item_leased_elsewhere_left_alone() {
    let env = setup_test_env("").await;
    let id = create_due_item(&env.db_path, &[PlatformKind::Vk]).await;

    let db = std::sync::Arc::new(Database::new(&env.db_path).await.unwrap());
    let locks = libsyndicast::LockManager::new(db.clone());
    assert!(locks
        .acquire(&id, "other-daemon", std::time::Duration::from_secs(600))
        .await
        .unwrap());

    daemon(&env).arg("--once").assert().success();

    let item = db.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ContentStatus::Scheduled);
}
