//! Periodic driver for due content
//!
//! Each tick lists the items due for an attempt, takes each item's lease,
//! and hands it to the [`PublishOrchestrator`]. Items whose lease is held
//! elsewhere are skipped until a later tick. The in-process `processing`
//! flag only stops overlapping ticks from doing redundant local work; the
//! lease is what prevents duplicate publication across processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::lock::LockManager;
use crate::orchestrator::{Disposition, PublishOrchestrator, PublishReport, RetryPolicy};
use crate::platforms::PlatformRegistry;
use crate::rate_limiter::RateLimiter;

/// Rate-limit windows older than this are purged at the start of a tick
const RATE_WINDOW_RETENTION_SECS: i64 = 2 * 3600;

/// Summary of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub processed: usize,
    pub skipped_locked: usize,
    pub errors: usize,
}

enum ItemResult {
    Processed,
    Locked,
    Failed,
}

pub struct Scheduler {
    orchestrator: PublishOrchestrator,
    db: Arc<Database>,
    locks: LockManager,
    rate_limiter: RateLimiter,
    holder_id: String,
    lock_ttl: Duration,
    max_concurrency: usize,
    poll_interval: Duration,
    processing: AtomicBool,
}

impl Scheduler {
    pub fn new(db: Arc<Database>, platforms: PlatformRegistry, config: &Config) -> Self {
        let rate_limiter = RateLimiter::from_config(&config.scheduling.hourly_limits());
        let lock_ttl = config.lock.ttl();
        let orchestrator = PublishOrchestrator::new(
            db.clone(),
            platforms,
            rate_limiter.clone(),
            RetryPolicy::from_config(&config.scheduling),
            lock_ttl,
        );

        Self {
            orchestrator,
            locks: LockManager::new(db.clone()),
            db,
            rate_limiter,
            holder_id: config
                .lock
                .holder_id
                .clone()
                .unwrap_or_else(LockManager::generate_holder_id),
            lock_ttl,
            max_concurrency: config.scheduling.max_concurrency.max(1),
            poll_interval: Duration::from_secs(config.scheduling.poll_interval),
            processing: AtomicBool::new(false),
        }
    }

    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Process everything due right now
    ///
    /// Returns an empty report when a previous tick is still running.
    /// Failures of individual items, including rows that cannot be decoded,
    /// are logged and counted; only failures to query due content abort the
    /// tick.
    pub async fn tick(&self) -> Result<TickReport> {
        if self.processing.swap(true, Ordering::AcqRel) {
            debug!("Previous tick still running, skipping");
            return Ok(TickReport::default());
        }
        let _processing = ProcessingGuard(&self.processing);

        let now = chrono::Utc::now().timestamp();
        let expired = self.locks.cleanup_expired().await?;
        if expired > 0 {
            debug!(count = expired, "Removed expired leases");
        }
        self.rate_limiter
            .cleanup_old_windows(&self.db, now - RATE_WINDOW_RETENTION_SECS)
            .await?;

        let due = self.db.list_due(now).await?;
        let mut report = TickReport {
            due: due.items.len() + due.undecodable.len(),
            errors: due.undecodable.len(),
            ..Default::default()
        };
        if due.items.is_empty() {
            return Ok(report);
        }

        info!(count = due.items.len(), "Found content due for publishing");

        let results: Vec<ItemResult> = stream::iter(due.items)
            .map(|item| async move { self.run_item(item.id).await })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                ItemResult::Processed => report.processed += 1,
                ItemResult::Locked => report.skipped_locked += 1,
                ItemResult::Failed => report.errors += 1,
            }
        }

        Ok(report)
    }

    /// Tick every poll interval until `shutdown` is set
    ///
    /// A tick in flight when shutdown is requested runs to completion.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(
            holder = %self.holder_id,
            poll_interval = ?self.poll_interval,
            "Scheduler started"
        );

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested, stopping scheduler");
                break;
            }

            match self.tick().await {
                Ok(report) if report.due > 0 => info!(
                    due = report.due,
                    processed = report.processed,
                    skipped_locked = report.skipped_locked,
                    errors = report.errors,
                    "Tick complete"
                ),
                Ok(_) => {}
                Err(e) => error!("Error processing due content: {}", e),
            }

            // Sleep until the next tick, checking for shutdown every second
            let deadline = Instant::now() + self.poll_interval;
            while !shutdown.load(Ordering::Relaxed) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                sleep(remaining.min(Duration::from_secs(1))).await;
            }
        }

        Ok(())
    }

    async fn run_item(&self, content_id: String) -> ItemResult {
        match self.locks.acquire(&content_id, &self.holder_id, self.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(content_id = %content_id, "Locked by another worker, skipping");
                return ItemResult::Locked;
            }
            Err(e) => {
                warn!(content_id = %content_id, error = %e, "Could not acquire lease");
                return ItemResult::Failed;
            }
        }

        let result = self.process_with_keepalive(&content_id).await;

        if let Err(e) = self.locks.release(&content_id, &self.holder_id).await {
            warn!(content_id = %content_id, error = %e, "Could not release lease");
        }

        match result {
            Ok(report) => {
                if let Disposition::Saved(status) = &report.disposition {
                    debug!(
                        content_id = %content_id,
                        status = %status,
                        attempted = report.attempted(),
                        "Content item processed"
                    );
                }
                ItemResult::Processed
            }
            Err(e) => {
                error!(content_id = %content_id, error = %e, "Failed to process content item");
                ItemResult::Failed
            }
        }
    }

    /// Run the orchestrator while renewing the lease every third of its ttl
    async fn process_with_keepalive(&self, content_id: &str) -> Result<PublishReport> {
        let process = self.orchestrator.process(content_id, &self.holder_id);
        tokio::pin!(process);

        let period = (self.lock_ttl / 3).max(Duration::from_secs(1));
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                result = &mut process => return result,
                _ = keepalive.tick() => {
                    match self.locks.renew(content_id, &self.holder_id, self.lock_ttl).await {
                        Ok(true) => debug!(content_id = %content_id, "Lease renewed"),
                        Ok(false) => warn!(content_id = %content_id, "Lease lost while publishing"),
                        Err(e) => warn!(content_id = %content_id, error = %e, "Could not renew lease"),
                    }
                }
            }
        }
    }
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
