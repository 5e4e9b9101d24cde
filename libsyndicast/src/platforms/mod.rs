//! Platform abstraction and implementations
//!
//! Every posting surface implements [`Platform`]. The orchestrator never
//! branches on a platform name: it looks the adapter up in a
//! [`PlatformRegistry`], renders the body in the adapter's
//! [`MarkupDialect`] and hands over the payload and media.
//!
//! # Examples
//!
//! ```no_run
//! use libsyndicast::config::Config;
//! use libsyndicast::platforms::create_platforms;
//! use libsyndicast::types::PlatformKind;
//!
//! # async fn example() -> libsyndicast::error::Result<()> {
//! let config = Config::load()?;
//! let registry = create_platforms(&config)?;
//!
//! if let Some(telegram) = registry.get(PlatformKind::Telegram) {
//!     let post = telegram.publish("<b>Hello</b>", &[]).await?;
//!     println!("Published: {}", post.post_url);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::Config;
use crate::error::{PlatformError, Result};
use crate::sanitizer::MarkupDialect;
use crate::types::{MediaRef, PlatformKind, PublishedPost};

pub mod container;
pub mod facebook;
mod graph;
pub mod instagram;
pub mod telegram;
pub mod vk;

// Mock platform is available for all builds (not just tests) to support integration tests
pub mod mock;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Post shapes an adapter can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether a post without media is allowed
    pub text_only: bool,
    /// Media items per post; 0 means media is not supported, above 1 enables carousels
    pub max_media: usize,
}

/// The concrete post an adapter builds for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostShape<'a> {
    TextOnly,
    Single(&'a MediaRef),
    Carousel(&'a [MediaRef]),
}

impl Capabilities {
    /// Pick the post shape for `media`
    ///
    /// Media beyond `max_media` is dropped with a warning. Text-only posts
    /// on media-only platforms are rejected.
    pub fn shape<'a>(&self, media: &'a [MediaRef]) -> std::result::Result<PostShape<'a>, PlatformError> {
        let usable = &media[..media.len().min(self.max_media)];
        if usable.len() < media.len() {
            tracing::warn!(
                dropped = media.len() - usable.len(),
                max_media = self.max_media,
                "Dropping media beyond platform limit"
            );
        }

        match usable {
            [] if self.text_only => Ok(PostShape::TextOnly),
            [] => Err(PlatformError::Rejected(
                "platform requires at least one media item".to_string(),
            )),
            [single] => Ok(PostShape::Single(single)),
            many => Ok(PostShape::Carousel(many)),
        }
    }
}

/// Platform trait for unified posting surface interactions
#[async_trait]
pub trait Platform: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// Markup the platform's renderer accepts
    fn dialect(&self) -> &MarkupDialect;

    fn capabilities(&self) -> Capabilities;

    /// Publish an already sanitized payload with its media
    ///
    /// # Errors
    ///
    /// Returns `SyndicastError::Platform` with the variant matching the
    /// failure class (authentication, network, media readiness, quota,
    /// rejection).
    async fn publish(&self, payload: &str, media: &[MediaRef]) -> Result<PublishedPost>;
}

/// Adapters available to this process, keyed by platform
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    platforms: HashMap<PlatformKind, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same platform
    pub fn register(&mut self, platform: Arc<dyn Platform>) {
        self.platforms.insert(platform.kind(), platform);
    }

    pub fn with(mut self, platform: Arc<dyn Platform>) -> Self {
        self.register(platform);
        self
    }

    pub fn get(&self, kind: PlatformKind) -> Option<Arc<dyn Platform>> {
        self.platforms.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<PlatformKind> {
        let mut kinds: Vec<_> = self.platforms.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("platforms", &self.kinds())
            .finish()
    }
}

/// Build adapters for every enabled platform in `config`
///
/// A platform whose credentials cannot be loaded is logged and left out;
/// items targeting it fail with `not_configured` instead of stopping the
/// daemon.
pub fn create_platforms(config: &Config) -> Result<PlatformRegistry> {
    let client = http_client()?;
    let mut registry = PlatformRegistry::new();

    if let Some(telegram) = config.telegram.as_ref().filter(|c| c.enabled) {
        match telegram::TelegramPlatform::from_config(telegram, client.clone()) {
            Ok(platform) => registry.register(Arc::new(platform)),
            Err(e) => tracing::warn!(platform = "telegram", error = %e, "Skipping platform"),
        }
    }

    if let Some(vk) = config.vk.as_ref().filter(|c| c.enabled) {
        match vk::VkPlatform::from_config(vk, client.clone()) {
            Ok(platform) => registry.register(Arc::new(platform)),
            Err(e) => tracing::warn!(platform = "vk", error = %e, "Skipping platform"),
        }
    }

    if let Some(instagram) = config.instagram.as_ref().filter(|c| c.enabled) {
        match instagram::InstagramPlatform::from_config(instagram, client.clone()) {
            Ok(platform) => registry.register(Arc::new(platform)),
            Err(e) => tracing::warn!(platform = "instagram", error = %e, "Skipping platform"),
        }
    }

    if let Some(facebook) = config.facebook.as_ref().filter(|c| c.enabled) {
        match facebook::FacebookPlatform::from_config(facebook, client) {
            Ok(platform) => registry.register(Arc::new(platform)),
            Err(e) => tracing::warn!(platform = "facebook", error = %e, "Skipping platform"),
        }
    }

    tracing::info!(platforms = ?registry.kinds(), "Platform adapters ready");
    Ok(registry)
}

/// Shared HTTP client for all adapters
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("syndicast/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PlatformError::NotConfigured(format!("failed to build HTTP client: {}", e)).into())
}

/// Read an API token from a file (tilde-expanded, surrounding whitespace trimmed)
pub fn read_token_file(path: &str) -> Result<SecretString> {
    let expanded = shellexpand::tilde(path).to_string();
    let raw = std::fs::read_to_string(Path::new(&expanded)).map_err(|e| {
        PlatformError::Authentication(format!("cannot read token file {}: {}", expanded, e))
    })?;

    let token = raw.trim();
    if token.is_empty() {
        return Err(PlatformError::Authentication(format!("token file {} is empty", expanded)).into());
    }
    Ok(SecretString::from(token.to_string()))
}

/// Map an unsuccessful HTTP status onto the error taxonomy
pub(crate) fn classify_status(status: u16, message: String) -> PlatformError {
    match status {
        401 | 403 => PlatformError::Authentication(message),
        429 => PlatformError::QuotaExceeded(message),
        408 | 500..=599 => PlatformError::Network(message),
        _ => PlatformError::Rejected(message),
    }
}

/// Map a transport-level failure onto the error taxonomy
///
/// The request URL is left out of the message; it may contain a token.
pub(crate) fn map_reqwest_error(error: reqwest::Error) -> PlatformError {
    let error = error.without_url();
    if let Some(status) = error.status() {
        return classify_status(status.as_u16(), error.to_string());
    }
    if error.is_decode() {
        return PlatformError::Rejected(format!("unexpected response: {}", error));
    }
    PlatformError::Network(error.to_string())
}
