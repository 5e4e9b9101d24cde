//! Per-platform posting budget
//!
//! Counts publication attempts per platform in hourly windows so the
//! scheduler stays under platform API limits.

use std::collections::HashMap;

use crate::db::Database;
use crate::error::{DbError, Result};
use crate::types::PlatformKind;

const WINDOW_SECS: i64 = 3600;

/// Hourly attempt limiter backed by the `rate_limits` table
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    /// Attempts allowed per hour, by platform; absent means unlimited
    limits: HashMap<PlatformKind, u32>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<PlatformKind, u32>) -> Self {
        Self { limits }
    }

    /// Build from the `[scheduling.rate_limits]` table, skipping unknown names
    pub fn from_config(limits: &HashMap<String, u32>) -> Self {
        let limits = limits
            .iter()
            .filter_map(|(name, limit)| match name.parse::<PlatformKind>() {
                Ok(platform) => Some((platform, *limit)),
                Err(e) => {
                    tracing::warn!("Ignoring rate limit: {}", e);
                    None
                }
            })
            .collect();
        Self { limits }
    }

    /// Reserve one attempt for `platform` in the window containing `now`
    ///
    /// Returns `Ok(false)` without recording anything when the window is full.
    pub async fn check_and_record(
        &self,
        db: &Database,
        platform: PlatformKind,
        now: i64,
    ) -> Result<bool> {
        let Some(limit) = self.limits.get(&platform).copied() else {
            return Ok(true);
        };
        if limit == 0 {
            return Ok(false);
        }

        let window_start = window_start(now);

        // Increment only while under the limit, in one statement
        let result = sqlx::query(
            r#"
            INSERT INTO rate_limits (platform, window_start, post_count)
            VALUES (?, ?, 1)
            ON CONFLICT(platform, window_start)
            DO UPDATE SET post_count = post_count + 1
            WHERE post_count < ?
            "#,
        )
        .bind(platform.as_str())
        .bind(window_start)
        .bind(i64::from(limit))
        .execute(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Attempts recorded for `platform` in the window containing `now`
    pub async fn used(&self, db: &Database, platform: PlatformKind, now: i64) -> Result<u32> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT post_count FROM rate_limits WHERE platform = ? AND window_start = ?",
        )
        .bind(platform.as_str())
        .bind(window_start(now))
        .fetch_optional(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.0 as u32).unwrap_or(0))
    }

    /// Delete windows that ended before `cutoff`
    pub async fn cleanup_old_windows(&self, db: &Database, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE window_start < ?")
            .bind(window_start(cutoff))
            .execute(db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

fn window_start(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(WINDOW_SECS)
}
