//! Lease-based locks on content items
//!
//! A lease gives one holder the exclusive right to run a publish attempt
//! for a content item until it expires. Every operation is a single SQLite
//! statement, so two processes sharing the database cannot both win the
//! same lease.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{DbError, Result};

/// An active lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_id: String,
    pub holder_id: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

/// Lock manager over the shared lock table
#[derive(Clone)]
pub struct LockManager {
    db: Arc<Database>,
}

impl LockManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Generate a holder identity unique to this process
    pub fn generate_holder_id() -> String {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        format!(
            "{}-{}-{}",
            host,
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        )
    }

    /// Try to take the lease on `resource_id`
    ///
    /// Succeeds when no lease exists or the existing one has expired.
    /// A live lease is never taken over, not even by its own holder.
    pub async fn acquire(&self, resource_id: &str, holder_id: &str, ttl: Duration) -> Result<bool> {
        self.acquire_at(resource_id, holder_id, ttl, now()).await
    }

    /// [`acquire`](Self::acquire) with an explicit clock reading
    pub async fn acquire_at(
        &self,
        resource_id: &str,
        holder_id: &str,
        ttl: Duration,
        now: i64,
    ) -> Result<bool> {
        let expires_at = now + ttl_secs(ttl);

        // The upsert only overwrites a row whose lease has run out
        let result = sqlx::query(
            r#"
            INSERT INTO publication_locks (resource_id, holder_id, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(resource_id) DO UPDATE SET
                holder_id = excluded.holder_id,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE publication_locks.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(resource_id)
        .bind(holder_id)
        .bind(now)
        .bind(expires_at)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let acquired = result.rows_affected() == 1;
        debug!(
            resource = %resource_id,
            holder = %holder_id,
            acquired,
            "lock acquire"
        );
        Ok(acquired)
    }

    /// Drop the lease if `holder_id` holds it
    ///
    /// Releasing a lease held by someone else (or nobody) is a no-op.
    /// Returns whether a lease was removed.
    pub async fn release(&self, resource_id: &str, holder_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM publication_locks WHERE resource_id = ? AND holder_id = ?",
        )
        .bind(resource_id)
        .bind(holder_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let released = result.rows_affected() == 1;
        if !released {
            debug!(
                resource = %resource_id,
                holder = %holder_id,
                "release ignored, lease not held"
            );
        }
        Ok(released)
    }

    /// Push the expiry of a live lease `ttl` into the future
    ///
    /// Only the current holder of an unexpired lease can renew it.
    pub async fn renew(&self, resource_id: &str, holder_id: &str, ttl: Duration) -> Result<bool> {
        self.renew_at(resource_id, holder_id, ttl, now()).await
    }

    /// [`renew`](Self::renew) with an explicit clock reading
    pub async fn renew_at(
        &self,
        resource_id: &str,
        holder_id: &str,
        ttl: Duration,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publication_locks SET expires_at = ?
            WHERE resource_id = ? AND holder_id = ? AND expires_at > ?
            "#,
        )
        .bind(now + ttl_secs(ttl))
        .bind(resource_id)
        .bind(holder_id)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Whether a live lease exists for `resource_id`
    pub async fn is_locked(&self, resource_id: &str) -> Result<bool> {
        Ok(self.lock_info(resource_id).await?.is_some())
    }

    /// The live lease on `resource_id`, if any
    pub async fn lock_info(&self, resource_id: &str) -> Result<Option<Lease>> {
        self.lock_info_at(resource_id, now()).await
    }

    pub async fn lock_info_at(&self, resource_id: &str, now: i64) -> Result<Option<Lease>> {
        let row = sqlx::query_as::<_, (String, String, i64, i64)>(
            r#"
            SELECT resource_id, holder_id, acquired_at, expires_at
            FROM publication_locks
            WHERE resource_id = ? AND expires_at > ?
            "#,
        )
        .bind(resource_id)
        .bind(now)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|(resource_id, holder_id, acquired_at, expires_at)| Lease {
            resource_id,
            holder_id,
            acquired_at,
            expires_at,
        }))
    }

    /// Delete every expired lease, returning how many were removed
    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.cleanup_expired_at(now()).await
    }

    pub async fn cleanup_expired_at(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM publication_locks WHERE expires_at <= ?")
            .bind(now)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "cleaned up expired publication locks");
        }
        Ok(removed)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Lease length in whole seconds, never shorter than one second
fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(30);

    async fn setup() -> (TempDir, LockManager) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("locks.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, LockManager::new(Arc::new(db)))
    }

    #[tokio::test]
    async fn test_acquire_free_resource() {
        let (_temp, locks) = setup().await;

        assert!(locks.acquire_at("item-1", "worker-a", TTL, 1_000).await.unwrap());

        let lease = locks.lock_info_at("item-1", 1_000).await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "worker-a");
        assert_eq!(lease.acquired_at, 1_000);
        assert_eq!(lease.expires_at, 1_030);
    }

    #[tokio::test]
    async fn test_live_lease_blocks_other_holder() {
        let (_temp, locks) = setup().await;

        assert!(locks.acquire_at("item-1", "worker-a", TTL, 1_000).await.unwrap());
        assert!(!locks.acquire_at("item-1", "worker-b", TTL, 1_010).await.unwrap());

        let lease = locks.lock_info_at("item-1", 1_010).await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "worker-a");
    }

    #[tokio::test]
    async fn test_live_lease_blocks_same_holder() {
        let (_temp, locks) = setup().await;

        assert!(locks.acquire_at("item-1", "worker-a", TTL, 1_000).await.unwrap());
        assert!(!locks.acquire_at("item-1", "worker-a", TTL, 1_001).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over() {
        let (_temp, locks) = setup().await;

        assert!(locks.acquire_at("item-1", "worker-a", TTL, 1_000).await.unwrap());
        assert!(locks.acquire_at("item-1", "worker-b", TTL, 1_030).await.unwrap());

        let lease = locks.lock_info_at("item-1", 1_031).await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "worker-b");
        assert_eq!(lease.expires_at, 1_060);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_exactly_one_wins() {
        let (_temp, locks) = setup().await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .acquire("item-race", &format!("worker-{}", i), TTL)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let (_temp, locks) = setup().await;

        locks.acquire_at("item-1", "worker-a", TTL, 1_000).await.unwrap();

        assert!(!locks.release("item-1", "worker-b").await.unwrap());
        assert!(locks.lock_info_at("item-1", 1_001).await.unwrap().is_some());

        assert!(locks.release("item-1", "worker-a").await.unwrap());
        assert!(locks.lock_info_at("item-1", 1_001).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_late_release_after_takeover_keeps_new_lease() {
        let (_temp, locks) = setup().await;

        locks.acquire_at("item-1", "worker-a", TTL, 1_000).await.unwrap();
        locks.acquire_at("item-1", "worker-b", TTL, 1_100).await.unwrap();

        assert!(!locks.release("item-1", "worker-a").await.unwrap());

        let lease = locks.lock_info_at("item-1", 1_101).await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "worker-b");
    }

    #[tokio::test]
    async fn test_release_unknown_resource_is_noop() {
        let (_temp, locks) = setup().await;
        assert!(!locks.release("never-locked", "worker-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_extends_for_holder_only() {
        let (_temp, locks) = setup().await;

        locks.acquire_at("item-1", "worker-a", TTL, 1_000).await.unwrap();

        assert!(!locks.renew_at("item-1", "worker-b", TTL, 1_020).await.unwrap());
        assert!(locks.renew_at("item-1", "worker-a", TTL, 1_020).await.unwrap());

        let lease = locks.lock_info_at("item-1", 1_040).await.unwrap().unwrap();
        assert_eq!(lease.expires_at, 1_050);

        // Renewal keeps other holders out past the original expiry
        assert!(!locks.acquire_at("item-1", "worker-b", TTL, 1_035).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_expired_lease_fails() {
        let (_temp, locks) = setup().await;

        locks.acquire_at("item-1", "worker-a", TTL, 1_000).await.unwrap();
        assert!(!locks.renew_at("item-1", "worker-a", TTL, 1_030).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_locked_and_lock_info_ignore_expired() {
        let (_temp, locks) = setup().await;

        assert!(!locks.is_locked("item-1").await.unwrap());

        locks.acquire("item-1", "worker-a", TTL).await.unwrap();
        assert!(locks.is_locked("item-1").await.unwrap());

        locks.acquire_at("item-2", "worker-a", TTL, 1_000).await.unwrap();
        assert!(locks.lock_info_at("item-2", 1_030).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_expired_removes_only_expired() {
        let (_temp, locks) = setup().await;

        locks.acquire_at("old-1", "worker-a", TTL, 1_000).await.unwrap();
        locks.acquire_at("old-2", "worker-a", TTL, 1_000).await.unwrap();
        locks.acquire_at("fresh", "worker-a", TTL, 2_000).await.unwrap();

        assert_eq!(locks.cleanup_expired_at(2_010).await.unwrap(), 2);
        assert!(locks.lock_info_at("fresh", 2_010).await.unwrap().is_some());
        assert_eq!(locks.cleanup_expired_at(2_010).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_leases_shared_across_database_handles() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("shared.db");
        let path = db_path.to_string_lossy();

        let process_a = LockManager::new(Arc::new(Database::new(&path).await.unwrap()));
        let process_b = LockManager::new(Arc::new(Database::new(&path).await.unwrap()));

        assert!(process_a.acquire("item-1", "a", TTL).await.unwrap());
        assert!(!process_b.acquire("item-1", "b", TTL).await.unwrap());
        assert!(process_a.release("item-1", "a").await.unwrap());
        assert!(process_b.acquire("item-1", "b", TTL).await.unwrap());
    }

    #[test]
    fn test_generated_holder_ids_are_unique() {
        let a = LockManager::generate_holder_id();
        let b = LockManager::generate_holder_id();
        assert_ne!(a, b);
        assert!(a.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_ttl_secs_has_one_second_floor() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(300)), 300);
    }
}
