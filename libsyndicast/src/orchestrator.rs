//! Per-item publication
//!
//! The orchestrator drives one content item, whose lease the caller
//! already holds, through every targeted platform:
//!
//! 1. validate the item (no targets or no schedule fails it outright)
//! 2. skip platforms that already carry a published record with a post URL
//! 3. skip platforms whose failure is final or still backing off
//! 4. consult the rate limiter
//! 5. render the body in each adapter's markup dialect and publish to all
//!    remaining platforms concurrently
//! 6. fold the outcomes into the item, recompute the aggregate status and
//!    the next retry time, and persist the item once
//!
//! The final write is guarded twice: the lease is renewed first (a lost
//! lease aborts the write) and the save is conditional on the revision read
//! earlier. A concurrent reschedule makes the save conflict; the fresh item
//! is re-read and this run's outcomes are re-applied to the platforms it
//! still targets. A concurrent delete drops the results.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::SchedulingConfig;
use crate::db::{Database, SaveOutcome};
use crate::error::{DbError, PlatformError, Result, SyndicastError};
use crate::lock::LockManager;
use crate::platforms::PlatformRegistry;
use crate::rate_limiter::RateLimiter;
use crate::sanitizer::sanitize;
use crate::types::{
    ContentItem, ContentStatus, ErrorKind, PlatformKind, PlatformPublication, PublicationError,
    PublicationStatus, PublishedPost,
};

const MAX_SAVE_ATTEMPTS: usize = 3;

/// When failed platforms are attempted again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed per platform before a retryable failure is final
    pub max_retries: u32,
    /// Seconds before a retryable failure is attempted again
    pub retry_delay: i64,
    /// Seconds before a quota failure is attempted again
    pub quota_backoff: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulingConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: secs(config.retry_delay),
            quota_backoff: secs(config.quota_backoff),
        }
    }

    fn backoff(&self, kind: ErrorKind) -> i64 {
        match kind {
            ErrorKind::QuotaExceeded => self.quota_backoff,
            _ => self.retry_delay,
        }
    }

    /// When a failed record may be attempted again, if ever
    pub fn retry_at(&self, record: &PlatformPublication) -> Option<i64> {
        if record.status != PublicationStatus::Failed {
            return None;
        }
        let error = record.error.as_ref()?;
        if !error.retryable || record.attempts >= self.max_retries {
            return None;
        }
        Some(record.last_attempt_at.unwrap_or(0) + self.backoff(error.kind))
    }

    /// Whether a record should be attempted in a run at `now`
    pub fn is_eligible(&self, record: &PlatformPublication, now: i64) -> bool {
        match record.status {
            PublicationStatus::Pending => true,
            PublicationStatus::Published => !record.is_complete(),
            PublicationStatus::Failed => self.retry_at(record).is_some_and(|at| at <= now),
        }
    }

    /// Earliest retry among the targeted platforms
    pub fn next_attempt(&self, item: &ContentItem) -> Option<i64> {
        item.targets
            .iter()
            .filter_map(|p| item.platform_state.get(p))
            .filter_map(|record| self.retry_at(record))
            .min()
    }
}

fn secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Why a platform was not attempted in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Published with a post URL in an earlier run
    AlreadyPublished,
    /// Failed permanently, out of attempts, or still backing off
    NotEligible,
    /// Hourly budget for the platform is spent
    RateLimited,
}

/// What happened to one platform in a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Published(PublishedPost),
    Failed(PublicationError),
    Skipped(SkipReason),
}

/// What happened to the item as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Results were written; the item now has this aggregate status
    Saved(ContentStatus),
    /// The item was deleted while the run was in flight
    Deleted,
    /// The item was no longer due when its lease was obtained
    NotDue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub content_id: String,
    pub disposition: Disposition,
    pub outcomes: Vec<(PlatformKind, AttemptOutcome)>,
}

impl PublishReport {
    pub fn outcome(&self, platform: PlatformKind) -> Option<&AttemptOutcome> {
        self.outcomes
            .iter()
            .find(|(p, _)| *p == platform)
            .map(|(_, outcome)| outcome)
    }

    /// Number of adapter calls made in the run
    pub fn attempted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| !matches!(o, AttemptOutcome::Skipped(_)))
            .count()
    }
}

/// Drives content items through their target platforms
#[derive(Clone)]
pub struct PublishOrchestrator {
    db: Arc<Database>,
    locks: LockManager,
    platforms: PlatformRegistry,
    rate_limiter: RateLimiter,
    policy: RetryPolicy,
    lock_ttl: Duration,
}

impl PublishOrchestrator {
    pub fn new(
        db: Arc<Database>,
        platforms: PlatformRegistry,
        rate_limiter: RateLimiter,
        policy: RetryPolicy,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            locks: LockManager::new(db.clone()),
            db,
            platforms,
            rate_limiter,
            policy,
            lock_ttl,
        }
    }

    /// Re-read `content_id` and publish it if it is still due
    ///
    /// The caller must hold the item's lease as `holder_id`. Reading the
    /// item after the lease is taken means a run never works from a copy
    /// that another worker has already published.
    pub async fn process(&self, content_id: &str, holder_id: &str) -> Result<PublishReport> {
        let now = chrono::Utc::now().timestamp();

        let Some(item) = self.db.get_item(content_id).await? else {
            debug!(content_id = %content_id, "Content item disappeared before publishing");
            return Ok(PublishReport {
                content_id: content_id.to_string(),
                disposition: Disposition::Deleted,
                outcomes: Vec::new(),
            });
        };

        if !item.is_due(now) {
            debug!(content_id = %content_id, status = %item.status, "Content item no longer due");
            return Ok(PublishReport {
                content_id: content_id.to_string(),
                disposition: Disposition::NotDue,
                outcomes: Vec::new(),
            });
        }

        self.publish(item, holder_id).await
    }

    /// Run one publication attempt for `item` and persist the result
    ///
    /// # Errors
    ///
    /// Database failures, and [`SyndicastError::LeaseLost`] when the lease
    /// expired or was taken over before the results could be written. In
    /// that case nothing is written.
    pub async fn publish(&self, mut item: ContentItem, holder_id: &str) -> Result<PublishReport> {
        let now = chrono::Utc::now().timestamp();

        if let Err(reason) = item.validate() {
            warn!(content_id = %item.id, reason = %reason, "Content item failed validation");
            let outcomes: Vec<_> = item
                .targets
                .iter()
                .filter(|p| !item.publication(**p).is_complete())
                .map(|p| {
                    let error = PublicationError::new(ErrorKind::Validation, reason.clone());
                    (*p, AttemptOutcome::Failed(error))
                })
                .collect();
            return self.persist(item, outcomes, holder_id, now).await;
        }

        item.prune_untargeted();

        let mut outcomes = Vec::new();
        let mut attempts = Vec::new();

        for platform in item.targets.iter().copied() {
            let record = item.publication(platform);

            if record.is_complete() {
                debug!(content_id = %item.id, platform = %platform, "Already published, skipping");
                outcomes.push((platform, AttemptOutcome::Skipped(SkipReason::AlreadyPublished)));
                continue;
            }
            if !self.policy.is_eligible(&record, now) {
                debug!(content_id = %item.id, platform = %platform, "Not eligible for retry, skipping");
                outcomes.push((platform, AttemptOutcome::Skipped(SkipReason::NotEligible)));
                continue;
            }

            let Some(adapter) = self.platforms.get(platform) else {
                let error = PlatformError::NotConfigured(format!("no adapter for {}", platform));
                outcomes.push((platform, AttemptOutcome::Failed(publication_error(&error))));
                continue;
            };

            if !self.rate_limiter.check_and_record(&self.db, platform, now).await? {
                info!(content_id = %item.id, platform = %platform, "Rate limit reached, deferring");
                outcomes.push((platform, AttemptOutcome::Skipped(SkipReason::RateLimited)));
                continue;
            }

            let payload = sanitize(&item.body, adapter.dialect());
            attempts.push((platform, adapter, payload));
        }

        let media = &item.media;
        let content_id = &item.id;
        let results = join_all(attempts.iter().map(|(platform, adapter, payload)| async move {
            info!(content_id = %content_id, platform = %platform, "Publishing");
            (*platform, adapter.publish(payload, media).await)
        }))
        .await;

        for (platform, result) in results {
            let outcome = match result {
                Ok(post) => {
                    info!(
                        content_id = %item.id,
                        platform = %platform,
                        post_url = %post.post_url,
                        "Published"
                    );
                    AttemptOutcome::Published(post)
                }
                Err(e) => {
                    let error = match e {
                        SyndicastError::Platform(error) => error,
                        other => PlatformError::Rejected(other.to_string()),
                    };
                    warn!(
                        content_id = %item.id,
                        platform = %platform,
                        retryable = error.is_retryable(),
                        error = %error,
                        "Publishing failed"
                    );
                    AttemptOutcome::Failed(publication_error(&error))
                }
            };
            outcomes.push((platform, outcome));
        }

        self.persist(item, outcomes, holder_id, now).await
    }

    async fn persist(
        &self,
        mut item: ContentItem,
        outcomes: Vec<(PlatformKind, AttemptOutcome)>,
        holder_id: &str,
        now: i64,
    ) -> Result<PublishReport> {
        let content_id = item.id.clone();

        if !self.locks.renew(&content_id, holder_id, self.lock_ttl).await? {
            warn!(content_id = %content_id, holder = %holder_id, "Lease lost, discarding results");
            return Err(SyndicastError::LeaseLost(content_id));
        }

        self.apply(&mut item, &outcomes, now);

        for _ in 0..MAX_SAVE_ATTEMPTS {
            match self.db.save_item(&item).await? {
                SaveOutcome::Saved => {
                    info!(content_id = %content_id, status = %item.status, "Content item updated");
                    return Ok(PublishReport {
                        content_id,
                        disposition: Disposition::Saved(item.status),
                        outcomes,
                    });
                }
                SaveOutcome::Deleted => {
                    warn!(content_id = %content_id, "Content item deleted during publishing, dropping results");
                    return Ok(PublishReport {
                        content_id,
                        disposition: Disposition::Deleted,
                        outcomes,
                    });
                }
                SaveOutcome::Conflict => {
                    debug!(content_id = %content_id, "Content item changed during publishing, merging results");
                    let Some(fresh) = self.db.get_item(&content_id).await? else {
                        return Ok(PublishReport {
                            content_id,
                            disposition: Disposition::Deleted,
                            outcomes,
                        });
                    };
                    item = fresh;
                    item.prune_untargeted();
                    self.apply(&mut item, &outcomes, now);
                }
            }
        }

        Err(DbError::Corrupt(format!(
            "content item {} kept changing while saving results",
            content_id
        ))
        .into())
    }

    /// Fold run outcomes into `item` and recompute derived fields
    ///
    /// Outcomes for platforms the item no longer targets are ignored, and a
    /// completed record is never overwritten.
    fn apply(&self, item: &mut ContentItem, outcomes: &[(PlatformKind, AttemptOutcome)], now: i64) {
        for (platform, outcome) in outcomes {
            if !item.targets.contains(platform) {
                continue;
            }
            let record = item.platform_state.entry(*platform).or_default();
            if record.is_complete() {
                continue;
            }
            match outcome {
                AttemptOutcome::Published(post) => record.mark_published(post, now),
                AttemptOutcome::Failed(error) => record.mark_failed(error.clone(), now),
                AttemptOutcome::Skipped(_) => {}
            }
        }

        item.refresh_status();
        item.next_attempt_at = match item.status {
            ContentStatus::Partial | ContentStatus::Failed => self.policy.next_attempt(item),
            _ => None,
        };
    }
}

fn publication_error(error: &PlatformError) -> PublicationError {
    PublicationError::new(error.kind(), error.to_string())
}
