//! Core types for Syndicast

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Platforms
// ============================================================================

/// External posting surface a content item can target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Telegram,
    Vk,
    Instagram,
    Facebook,
}

impl PlatformKind {
    pub const ALL: [PlatformKind; 4] = [
        PlatformKind::Telegram,
        PlatformKind::Vk,
        PlatformKind::Instagram,
        PlatformKind::Facebook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Telegram => "telegram",
            PlatformKind::Vk => "vk",
            PlatformKind::Instagram => "instagram",
            PlatformKind::Facebook => "facebook",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "telegram" => Ok(PlatformKind::Telegram),
            "vk" => Ok(PlatformKind::Vk),
            "instagram" => Ok(PlatformKind::Instagram),
            "facebook" => Ok(PlatformKind::Facebook),
            other => Err(format!(
                "Unknown platform: '{}'. Valid options: telegram, vk, instagram, facebook",
                other
            )),
        }
    }
}

// ============================================================================
// Statuses
// ============================================================================

/// Aggregate status of a content item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Draft,
    Scheduled,
    Partial,
    Published,
    Failed,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Draft => "draft",
            ContentStatus::Scheduled => "scheduled",
            ContentStatus::Partial => "partial",
            ContentStatus::Published => "published",
            ContentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ContentStatus::Draft),
            "scheduled" => Ok(ContentStatus::Scheduled),
            "partial" => Ok(ContentStatus::Partial),
            "published" => Ok(ContentStatus::Published),
            "failed" => Ok(ContentStatus::Failed),
            other => Err(format!("Unknown content status: '{}'", other)),
        }
    }
}

/// Status of one platform's publication record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PublicationStatus {
    #[default]
    Pending,
    Published,
    Failed,
}

/// Persisted classification of a platform failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TransientNetwork,
    MediaNotReady,
    Auth,
    QuotaExceeded,
    Rejected,
    NotConfigured,
}

impl ErrorKind {
    /// Whether failures of this kind are retried by a later scheduler tick
    ///
    /// Quota failures are retried too, but only after the long quota backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork | ErrorKind::MediaNotReady | ErrorKind::QuotaExceeded
        )
    }
}

/// Most recent error recorded for a platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicationError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl PublicationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }
}

// ============================================================================
// Platform Publication
// ============================================================================

/// Per-platform outcome record attached to a content item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlatformPublication {
    pub status: PublicationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PublicationError>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
}

impl PlatformPublication {
    pub fn pending() -> Self {
        Self::default()
    }

    /// Published with a post URL: evidence of completion that must never be
    /// overwritten by a later attempt
    pub fn is_complete(&self) -> bool {
        self.status == PublicationStatus::Published
            && self.post_url.as_deref().is_some_and(|url| !url.is_empty())
    }

    pub fn mark_published(&mut self, post: &PublishedPost, now: i64) {
        self.status = PublicationStatus::Published;
        self.post_url = Some(post.post_url.clone());
        self.post_id = Some(post.post_id.clone());
        self.published_at = Some(now);
        self.error = None;
        self.attempts += 1;
        self.last_attempt_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: PublicationError, now: i64) {
        self.status = PublicationStatus::Failed;
        self.error = Some(error);
        self.attempts += 1;
        self.last_attempt_at = Some(now);
    }
}

/// Successful adapter result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedPost {
    pub post_id: String,
    pub post_url: String,
}

// ============================================================================
// Media
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Guess the media kind from a URL's file extension, defaulting to image
    pub fn from_url(url: &str) -> Self {
        let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url);
        let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_lowercase());
        match ext.as_deref() {
            Some("mp4") | Some("mov") | Some("m4v") | Some("webm") => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }
}

/// Reference to media held by the external media store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
    pub kind: MediaKind,
}

impl MediaRef {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let kind = MediaKind::from_url(&url);
        Self { url, kind }
    }
}

// ============================================================================
// Content Item
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentItem {
    pub id: String,
    /// Rich-text (HTML) body as authored
    pub body: String,
    pub media: Vec<MediaRef>,
    pub targets: BTreeSet<PlatformKind>,
    pub status: ContentStatus,
    pub scheduled_at: Option<i64>,
    /// Earliest time a retryable failure becomes eligible again
    pub next_attempt_at: Option<i64>,
    pub platform_state: BTreeMap<PlatformKind, PlatformPublication>,
    /// Optimistic concurrency token, bumped on every save
    pub revision: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ContentItem {
    /// Create a scheduled item with a pending record for every target
    pub fn new(
        body: impl Into<String>,
        targets: impl IntoIterator<Item = PlatformKind>,
        scheduled_at: i64,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        let targets: BTreeSet<PlatformKind> = targets.into_iter().collect();
        let platform_state = targets
            .iter()
            .map(|p| (*p, PlatformPublication::pending()))
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            body: body.into(),
            media: Vec::new(),
            targets,
            status: ContentStatus::Scheduled,
            scheduled_at: Some(scheduled_at),
            next_attempt_at: None,
            platform_state,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_media(mut self, media: impl IntoIterator<Item = MediaRef>) -> Self {
        self.media = media.into_iter().collect();
        self
    }

    /// Check the preconditions for any publication attempt
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.targets.is_empty() {
            return Err("no target platforms selected".to_string());
        }
        if self.scheduled_at.is_none() {
            return Err("missing scheduled time".to_string());
        }
        Ok(())
    }

    /// Record for `platform`, or a pending placeholder when none exists yet
    pub fn publication(&self, platform: PlatformKind) -> PlatformPublication {
        self.platform_state
            .get(&platform)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the target set
    ///
    /// Records for platforms no longer targeted are deleted, new targets
    /// start pending, and the aggregate status is recomputed.
    pub fn retarget(&mut self, targets: impl IntoIterator<Item = PlatformKind>) {
        self.targets = targets.into_iter().collect();
        self.prune_untargeted();
        for platform in &self.targets {
            self.platform_state.entry(*platform).or_default();
        }
        self.refresh_status();
    }

    /// Move the item to a new time and target set
    ///
    /// Completed records survive when still targeted; every other targeted
    /// platform restarts from pending with a fresh attempt budget.
    pub fn reschedule(&mut self, targets: impl IntoIterator<Item = PlatformKind>, scheduled_at: i64) {
        self.scheduled_at = Some(scheduled_at);
        self.next_attempt_at = None;
        for record in self.platform_state.values_mut() {
            if !record.is_complete() {
                *record = PlatformPublication::pending();
            }
        }
        self.retarget(targets);
    }

    /// Whether a publish attempt should run at `now`
    pub fn is_due(&self, now: i64) -> bool {
        match self.status {
            ContentStatus::Scheduled => self.scheduled_at.map_or(true, |at| at <= now),
            ContentStatus::Partial | ContentStatus::Failed => {
                self.next_attempt_at.is_some_and(|at| at <= now)
            }
            ContentStatus::Draft | ContentStatus::Published => false,
        }
    }

    /// Drop records for platforms outside the target set
    pub fn prune_untargeted(&mut self) {
        let targets = &self.targets;
        self.platform_state.retain(|p, _| targets.contains(p));
    }

    pub fn refresh_status(&mut self) {
        self.status = aggregate_status(&self.targets, &self.platform_state);
    }
}

/// Derive the aggregate status of an item from its per-platform records
///
/// A target without a record counts as pending. An empty target set can
/// never be published and is reported as failed.
pub fn aggregate_status(
    targets: &BTreeSet<PlatformKind>,
    state: &BTreeMap<PlatformKind, PlatformPublication>,
) -> ContentStatus {
    if targets.is_empty() {
        return ContentStatus::Failed;
    }

    let mut published = 0;
    let mut failed = 0;
    for platform in targets {
        match state.get(platform).map(|r| r.status).unwrap_or_default() {
            PublicationStatus::Pending => return ContentStatus::Scheduled,
            PublicationStatus::Published => published += 1,
            PublicationStatus::Failed => failed += 1,
        }
    }

    match (published, failed) {
        (_, 0) => ContentStatus::Published,
        (0, _) => ContentStatus::Failed,
        _ => ContentStatus::Partial,
    }
}
