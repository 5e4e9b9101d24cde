//! Mock platform implementation for testing
//!
//! This module provides a configurable mock platform that can simulate
//! successes, failures and delays. It's designed for use in orchestrator and
//! scheduler tests without platform credentials or network access.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::{Capabilities, Platform};
use crate::sanitizer::MarkupDialect;
use crate::types::{MediaRef, PlatformKind, PublishedPost};

/// A recorded `publish` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub payload: String,
    pub media: Vec<MediaRef>,
}

/// Configuration for mock platform behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub kind: PlatformKind,

    pub dialect: MarkupDialect,

    pub capabilities: Capabilities,

    /// Outcomes returned by successive calls; once drained, calls succeed
    pub script: Arc<Mutex<VecDeque<std::result::Result<(), PlatformError>>>>,

    /// Delay before completing a call (simulates network latency)
    pub delay: Duration,

    /// Calls made so far (shared so clones observe the same history)
    pub calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockConfig {
    pub fn new(kind: PlatformKind) -> Self {
        Self {
            kind,
            dialect: MarkupDialect::TELEGRAM_HTML,
            capabilities: Capabilities {
                text_only: true,
                max_media: 10,
            },
            script: Arc::new(Mutex::new(VecDeque::new())),
            delay: Duration::from_millis(0),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Mock platform for testing
#[derive(Debug, Clone)]
pub struct MockPlatform {
    config: MockConfig,
}

impl MockPlatform {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// Create a mock platform that always succeeds
    pub fn success(kind: PlatformKind) -> Self {
        Self::new(MockConfig::new(kind))
    }

    /// Create a mock platform whose every call fails with `error`
    pub fn failing(kind: PlatformKind, error: PlatformError) -> Self {
        let platform = Self::success(kind);
        platform.push_outcomes(std::iter::repeat(Err(error)).take(64));
        platform
    }

    /// Create a mock platform with a delay
    pub fn with_delay(kind: PlatformKind, delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..MockConfig::new(kind)
        })
    }

    pub fn with_dialect(mut self, dialect: MarkupDialect) -> Self {
        self.config.dialect = dialect;
        self
    }

    /// Queue outcomes for the next calls
    pub fn push_outcomes(
        &self,
        outcomes: impl IntoIterator<Item = std::result::Result<(), PlatformError>>,
    ) {
        lock(&self.config.script).extend(outcomes);
    }

    /// Number of times publish was called
    pub fn call_count(&self) -> usize {
        lock(&self.config.calls).len()
    }

    /// Every publish call so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.config.calls).clone()
    }
}

// A poisoned mutex only means another test thread panicked mid-call
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Platform for MockPlatform {
    fn kind(&self) -> PlatformKind {
        self.config.kind
    }

    fn dialect(&self) -> &MarkupDialect {
        &self.config.dialect
    }

    fn capabilities(&self) -> Capabilities {
        self.config.capabilities
    }

    async fn publish(&self, payload: &str, media: &[MediaRef]) -> Result<PublishedPost> {
        let call_number = {
            let mut calls = lock(&self.config.calls);
            calls.push(MockCall {
                payload: payload.to_string(),
                media: media.to_vec(),
            });
            calls.len()
        };

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        let outcome = lock(&self.config.script).pop_front().unwrap_or(Ok(()));
        outcome?;

        let post_id = format!("mock-{}", call_number);
        Ok(PublishedPost {
            post_url: format!("https://mock.example/{}/{}", self.config.kind, post_id),
            post_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyndicastError;

    #[tokio::test]
    async fn test_mock_success_records_calls() {
        let platform = MockPlatform::success(PlatformKind::Telegram);
        let media = vec![MediaRef::new("https://cdn.example.com/a.jpg")];

        let post = platform.publish("<b>hi</b>", &media).await.unwrap();

        assert_eq!(post.post_id, "mock-1");
        assert_eq!(post.post_url, "https://mock.example/telegram/mock-1");
        assert_eq!(platform.call_count(), 1);
        assert_eq!(platform.calls()[0].payload, "<b>hi</b>");
        assert_eq!(platform.calls()[0].media, media);
    }

    #[tokio::test]
    async fn test_mock_scripted_outcomes() {
        let platform = MockPlatform::success(PlatformKind::Vk);
        platform.push_outcomes([Err(PlatformError::Network("reset".to_string()))]);

        let first = platform.publish("x", &[]).await;
        assert!(matches!(
            first,
            Err(SyndicastError::Platform(PlatformError::Network(_)))
        ));
        assert!(platform.publish("x", &[]).await.is_ok());
        assert_eq!(platform.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_failing_always_fails() {
        let platform = MockPlatform::failing(
            PlatformKind::Vk,
            PlatformError::Authentication("revoked".to_string()),
        );
        for _ in 0..3 {
            assert!(platform.publish("x", &[]).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_clones_share_history() {
        let platform = MockPlatform::success(PlatformKind::Telegram);
        let clone = platform.clone();

        clone.publish("x", &[]).await.unwrap();
        assert_eq!(platform.call_count(), 1);
    }
}
