//! Database operations for Syndicast
//!
//! The content store keeps one row per content item. Media references,
//! the target set and the per-platform publication records are stored as
//! JSON documents so a save replaces them as a whole.

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{DbError, Result};
use crate::types::{ContentItem, ContentStatus, PlatformKind};

/// Result of a conditional save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The row changed since it was read (revision mismatch)
    Conflict,
    /// The row no longer exists
    Deleted,
}

/// Rows returned by [`Database::list_due`]
#[derive(Debug, Default)]
pub struct DueItems {
    pub items: Vec<ContentItem>,
    /// Ids of due rows whose stored documents could not be decoded
    pub undecodable: Vec<String>,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

const ITEM_COLUMNS: &str = "id, body, media, targets, status, scheduled_at, next_attempt_at, \
                            platform_state, revision, created_at, updated_at";

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work for SQLite URLs on every platform
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new content item
    pub async fn create_item(&self, item: &ContentItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO content_items (id, body, media, targets, status, scheduled_at,
                                       next_attempt_at, platform_state, revision,
                                       created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.body)
        .bind(serde_json::to_string(&item.media).map_err(DbError::Serialization)?)
        .bind(serde_json::to_string(&item.targets).map_err(DbError::Serialization)?)
        .bind(item.status.as_str())
        .bind(item.scheduled_at)
        .bind(item.next_attempt_at)
        .bind(serde_json::to_string(&item.platform_state).map_err(DbError::Serialization)?)
        .bind(item.revision)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Get a content item by ID
    pub async fn get_item(&self, id: &str) -> Result<Option<ContentItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM content_items WHERE id = ?",
            ITEM_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(item_from_row).transpose()
    }

    /// Items due for a publication attempt at `before`
    ///
    /// Scheduled items are due once their scheduled time passes (or at once
    /// when they have none, so validation can fail them). Partially
    /// published or failed items come back when a retryable failure's
    /// backoff has elapsed. Mirrors [`ContentItem::is_due`].
    ///
    /// A row that fails to decode is logged and reported by id instead of
    /// failing the whole listing.
    pub async fn list_due(&self, before: i64) -> Result<DueItems> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM content_items
            WHERE (status = 'scheduled' AND (scheduled_at IS NULL OR scheduled_at <= ?))
               OR (status IN ('partial', 'failed')
                   AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?)
            ORDER BY scheduled_at ASC, created_at ASC
            "#,
            ITEM_COLUMNS
        ))
        .bind(before)
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut due = DueItems::default();
        for row in &rows {
            match item_from_row(row) {
                Ok(item) => due.items.push(item),
                Err(e) => {
                    let id: String = row.get("id");
                    warn!(content_id = %id, error = %e, "Skipping content item that cannot be decoded");
                    due.undecodable.push(id);
                }
            }
        }
        Ok(due)
    }

    /// Replace the publication state of an item
    ///
    /// Writes `status`, `platform_state` and `next_attempt_at` as one
    /// document, only if the stored revision still equals `item.revision`.
    /// The check doubles as the existence re-check before persisting.
    pub async fn save_item(&self, item: &ContentItem) -> Result<SaveOutcome> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE content_items
            SET status = ?, platform_state = ?, next_attempt_at = ?,
                revision = revision + 1, updated_at = ?
            WHERE id = ? AND revision = ?
            "#,
        )
        .bind(item.status.as_str())
        .bind(serde_json::to_string(&item.platform_state).map_err(DbError::Serialization)?)
        .bind(item.next_attempt_at)
        .bind(now)
        .bind(&item.id)
        .bind(item.revision)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 1 {
            return Ok(SaveOutcome::Saved);
        }

        self.classify_missed_write(&item.id).await
    }

    /// Move an item to a new time and target set
    ///
    /// Records for platforms removed from the set are deleted. Returns the
    /// updated item, or `None` when it does not exist.
    pub async fn reschedule_item(
        &self,
        id: &str,
        targets: &BTreeSet<PlatformKind>,
        scheduled_at: i64,
    ) -> Result<Option<ContentItem>> {
        const MAX_ATTEMPTS: usize = 3;

        for _ in 0..MAX_ATTEMPTS {
            let Some(mut item) = self.get_item(id).await? else {
                return Ok(None);
            };

            item.reschedule(targets.iter().copied(), scheduled_at);

            let now = chrono::Utc::now().timestamp();
            let result = sqlx::query(
                r#"
                UPDATE content_items
                SET targets = ?, scheduled_at = ?, status = ?, platform_state = ?,
                    next_attempt_at = NULL, revision = revision + 1, updated_at = ?
                WHERE id = ? AND revision = ?
                "#,
            )
            .bind(serde_json::to_string(&item.targets).map_err(DbError::Serialization)?)
            .bind(scheduled_at)
            .bind(item.status.as_str())
            .bind(serde_json::to_string(&item.platform_state).map_err(DbError::Serialization)?)
            .bind(now)
            .bind(id)
            .bind(item.revision)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

            if result.rows_affected() == 1 {
                item.revision += 1;
                item.updated_at = now;
                return Ok(Some(item));
            }

            debug!(content_id = %id, "reschedule raced with another writer, retrying");
        }

        Err(DbError::Corrupt(format!(
            "content item {} kept changing during reschedule",
            id
        ))
        .into())
    }

    /// Delete a content item, returning whether it existed
    pub async fn delete_item(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM content_items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn classify_missed_write(&self, id: &str) -> Result<SaveOutcome> {
        let exists = sqlx::query("SELECT 1 FROM content_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(if exists.is_some() {
            SaveOutcome::Conflict
        } else {
            SaveOutcome::Deleted
        })
    }
}

fn item_from_row(row: &SqliteRow) -> Result<ContentItem> {
    let status: String = row.get("status");
    let status: ContentStatus = status.parse().map_err(DbError::Corrupt)?;

    let media: String = row.get("media");
    let targets: String = row.get("targets");
    let platform_state: String = row.get("platform_state");

    Ok(ContentItem {
        id: row.get("id"),
        body: row.get("body"),
        media: serde_json::from_str(&media).map_err(DbError::Serialization)?,
        targets: serde_json::from_str(&targets).map_err(DbError::Serialization)?,
        status,
        scheduled_at: row.get("scheduled_at"),
        next_attempt_at: row.get("next_attempt_at"),
        platform_state: serde_json::from_str(&platform_state).map_err(DbError::Serialization)?,
        revision: row.get("revision"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ErrorKind, MediaRef, PlatformPublication, PublicationError, PublicationStatus,
        PublishedPost,
    };
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    fn scheduled_item(at: i64) -> ContentItem {
        ContentItem::new(
            "<p>Launch <b>today</b></p>",
            [PlatformKind::Telegram, PlatformKind::Vk],
            at,
        )
        .with_media([MediaRef::new("https://cdn.example/launch.jpg")])
    }

    fn telegram_post() -> PublishedPost {
        PublishedPost {
            post_id: "42".to_string(),
            post_url: "https://t.me/syndicast/42".to_string(),
        }
    }

    #[tokio::test]
    async fn test_database_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("dir").join("content.db");

        Database::new(&db_path.to_string_lossy()).await.unwrap();

        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_create_and_get_item_round_trip() {
        let (_temp, db) = setup_test_db().await;
        let item = scheduled_item(1_000);

        db.create_item(&item).await.unwrap();
        let loaded = db.get_item(&item.id).await.unwrap().unwrap();

        assert_eq!(loaded, item);
    }

    #[tokio::test]
    async fn test_get_missing_item_returns_none() {
        let (_temp, db) = setup_test_db().await;
        assert!(db.get_item("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_due_selects_scheduled_items_in_past() {
        let (_temp, db) = setup_test_db().await;
        let due = scheduled_item(1_000);
        let future = scheduled_item(5_000);
        let mut draft = scheduled_item(500);
        draft.status = ContentStatus::Draft;

        db.create_item(&due).await.unwrap();
        db.create_item(&future).await.unwrap();
        db.create_item(&draft).await.unwrap();

        let listed = db.list_due(2_000).await.unwrap();

        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.items[0].id, due.id);
        assert!(listed.undecodable.is_empty());
    }

    #[tokio::test]
    async fn test_list_due_includes_retry_eligible_items() {
        let (_temp, db) = setup_test_db().await;

        let mut retry_now = scheduled_item(100);
        retry_now.status = ContentStatus::Partial;
        retry_now.next_attempt_at = Some(1_500);

        let mut retry_later = scheduled_item(100);
        retry_later.status = ContentStatus::Failed;
        retry_later.next_attempt_at = Some(9_000);

        let mut final_failure = scheduled_item(100);
        final_failure.status = ContentStatus::Failed;

        db.create_item(&retry_now).await.unwrap();
        db.create_item(&retry_later).await.unwrap();
        db.create_item(&final_failure).await.unwrap();

        let listed = db.list_due(2_000).await.unwrap();

        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.items[0].id, retry_now.id);
    }

    #[tokio::test]
    async fn test_list_due_skips_undecodable_rows() {
        let (_temp, db) = setup_test_db().await;
        let good = scheduled_item(1_000);
        let corrupt = scheduled_item(1_100);
        db.create_item(&good).await.unwrap();
        db.create_item(&corrupt).await.unwrap();

        sqlx::query("UPDATE content_items SET platform_state = 'not json' WHERE id = ?")
            .bind(&corrupt.id)
            .execute(db.pool())
            .await
            .unwrap();

        let listed = db.list_due(2_000).await.unwrap();

        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.items[0].id, good.id);
        assert_eq!(listed.undecodable, vec![corrupt.id.clone()]);
        assert!(db.get_item(&corrupt.id).await.is_err());
    }

    #[tokio::test]
    async fn test_save_item_replaces_platform_state() {
        let (_temp, db) = setup_test_db().await;
        let mut item = scheduled_item(1_000);
        db.create_item(&item).await.unwrap();

        item.platform_state
            .get_mut(&PlatformKind::Telegram)
            .unwrap()
            .mark_published(&telegram_post(), 1_100);
        item.platform_state.get_mut(&PlatformKind::Vk).unwrap().mark_failed(
            PublicationError::new(ErrorKind::Auth, "token expired"),
            1_100,
        );
        item.refresh_status();

        assert_eq!(db.save_item(&item).await.unwrap(), SaveOutcome::Saved);

        let loaded = db.get_item(&item.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ContentStatus::Partial);
        assert_eq!(loaded.revision, item.revision + 1);
        assert_eq!(
            loaded.platform_state[&PlatformKind::Telegram].post_url.as_deref(),
            Some("https://t.me/syndicast/42")
        );
        let vk_error = loaded.platform_state[&PlatformKind::Vk].error.clone().unwrap();
        assert_eq!(vk_error.kind, ErrorKind::Auth);
        assert!(!vk_error.retryable);
    }

    #[tokio::test]
    async fn test_save_item_with_stale_revision_conflicts() {
        let (_temp, db) = setup_test_db().await;
        let item = scheduled_item(1_000);
        db.create_item(&item).await.unwrap();

        assert_eq!(db.save_item(&item).await.unwrap(), SaveOutcome::Saved);
        // Same revision again: the stored row has moved on
        assert_eq!(db.save_item(&item).await.unwrap(), SaveOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_save_deleted_item_reports_deleted() {
        let (_temp, db) = setup_test_db().await;
        let item = scheduled_item(1_000);
        db.create_item(&item).await.unwrap();

        assert!(db.delete_item(&item.id).await.unwrap());
        assert_eq!(db.save_item(&item).await.unwrap(), SaveOutcome::Deleted);
        assert!(!db.delete_item(&item.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reschedule_removes_untargeted_records() {
        let (_temp, db) = setup_test_db().await;
        let mut item = scheduled_item(1_000);
        item.platform_state
            .get_mut(&PlatformKind::Vk)
            .unwrap()
            .mark_published(
                &PublishedPost {
                    post_id: "7".to_string(),
                    post_url: "https://vk.com/wall-1_7".to_string(),
                },
                900,
            );
        db.create_item(&item).await.unwrap();

        let targets: BTreeSet<_> = [PlatformKind::Telegram].into_iter().collect();
        let updated = db
            .reschedule_item(&item.id, &targets, 2_000)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.platform_state.len(), 1);
        assert!(updated.platform_state.contains_key(&PlatformKind::Telegram));

        let loaded = db.get_item(&item.id).await.unwrap().unwrap();
        assert_eq!(loaded.targets, targets);
        assert_eq!(loaded.scheduled_at, Some(2_000));
        assert_eq!(loaded.status, ContentStatus::Scheduled);
        assert_eq!(loaded.platform_state.len(), 1);
        assert_eq!(
            loaded.platform_state[&PlatformKind::Telegram].status,
            PublicationStatus::Pending
        );
        assert_eq!(loaded.revision, updated.revision);
    }

    #[tokio::test]
    async fn test_reschedule_missing_item_returns_none() {
        let (_temp, db) = setup_test_db().await;
        let targets: BTreeSet<_> = [PlatformKind::Telegram].into_iter().collect();
        assert!(db.reschedule_item("missing", &targets, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_status_is_reported() {
        let (_temp, db) = setup_test_db().await;
        let item = scheduled_item(1_000);
        db.create_item(&item).await.unwrap();

        sqlx::query("UPDATE content_items SET platform_state = 'not json' WHERE id = ?")
            .bind(&item.id)
            .execute(db.pool())
            .await
            .unwrap();

        let err = db.get_item(&item.id).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::SyndicastError::Database(DbError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_status_check_constraint() {
        let (_temp, db) = setup_test_db().await;
        let item = scheduled_item(1_000);
        db.create_item(&item).await.unwrap();

        let result = sqlx::query("UPDATE content_items SET status = 'posted' WHERE id = ?")
            .bind(&item.id)
            .execute(db.pool())
            .await;

        assert!(result.is_err(), "CHECK constraint should reject unknown status");
    }

    #[tokio::test]
    async fn test_pending_records_survive_round_trip() {
        let (_temp, db) = setup_test_db().await;
        let item = scheduled_item(1_000);
        db.create_item(&item).await.unwrap();

        let loaded = db.get_item(&item.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.platform_state[&PlatformKind::Vk],
            PlatformPublication::pending()
        );
    }
}
