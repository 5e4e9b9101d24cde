//! Configuration management for Syndicast

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub lock: LockConfig,
    pub telegram: Option<TelegramConfig>,
    pub vk: Option<VkConfig>,
    pub instagram: Option<InstagramConfig>,
    pub facebook: Option<FacebookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between scheduler ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Content items orchestrated concurrently within one tick
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Attempts allowed per platform before a retryable failure becomes final
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds before a retryable failure is attempted again
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Seconds before a quota failure is attempted again
    #[serde(default = "default_quota_backoff")]
    pub quota_backoff: u64,
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: default_poll_interval(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            quota_backoff: default_quota_backoff(),
            rate_limits: HashMap::new(),
        }
    }
}

impl SchedulingConfig {
    /// Posts-per-hour limits keyed by platform name
    pub fn hourly_limits(&self) -> HashMap<String, u32> {
        self.rate_limits
            .iter()
            .map(|(platform, limit)| (platform.clone(), limit.posts_per_hour))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub posts_per_hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease length in seconds
    #[serde(default = "default_lock_ttl")]
    pub ttl: u64,
    /// Fixed holder identity; generated per process when absent
    pub holder_id: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: default_lock_ttl(),
            holder_id: None,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub token_file: String,
    /// `@channelname` or numeric chat id
    pub chat_id: String,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
    #[serde(default = "default_caption_limit")]
    pub caption_limit: usize,
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VkConfig {
    pub enabled: bool,
    pub token_file: String,
    /// Wall owner; negative for communities
    pub owner_id: i64,
    #[serde(default = "default_vk_api")]
    pub api_base: String,
    #[serde(default = "default_vk_version")]
    pub api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstagramConfig {
    pub enabled: bool,
    pub token_file: String,
    /// Instagram business account id
    pub account_id: String,
    #[serde(default = "default_graph_api")]
    pub api_base: String,
    #[serde(default = "default_ig_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_ig_poll_max_attempts")]
    pub poll_max_attempts: u32,
    #[serde(default = "default_ig_caption_limit")]
    pub caption_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacebookConfig {
    pub enabled: bool,
    /// Page access token
    pub token_file: String,
    pub page_id: String,
    #[serde(default = "default_graph_api")]
    pub api_base: String,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    20
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    300
}

fn default_quota_backoff() -> u64 {
    3600
}

fn default_lock_ttl() -> u64 {
    300
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_caption_limit() -> usize {
    1024
}

fn default_message_limit() -> usize {
    4096
}

fn default_vk_api() -> String {
    "https://api.vk.com/method".to_string()
}

fn default_vk_version() -> String {
    "5.199".to_string()
}

fn default_graph_api() -> String {
    "https://graph.facebook.com/v20.0".to_string()
}

fn default_ig_poll_interval_ms() -> u64 {
    5000
}

fn default_ig_poll_max_attempts() -> u32 {
    12
}

fn default_ig_caption_limit() -> usize {
    2200
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.scheduling.poll_interval == 0 {
            return Err(invalid("scheduling.poll_interval", "must be greater than zero"));
        }
        if self.scheduling.max_concurrency == 0 {
            return Err(invalid("scheduling.max_concurrency", "must be greater than zero"));
        }
        if self.lock.ttl == 0 {
            return Err(invalid("lock.ttl", "must be greater than zero"));
        }
        if let Some(telegram) = &self.telegram {
            if telegram.caption_limit == 0 || telegram.caption_limit > telegram.message_limit {
                return Err(invalid(
                    "telegram.caption_limit",
                    "must be between 1 and telegram.message_limit",
                ));
            }
        }
        if let Some(instagram) = &self.instagram {
            if instagram.poll_max_attempts == 0 {
                return Err(invalid("instagram.poll_max_attempts", "must be greater than zero"));
            }
        }
        if let Some(facebook) = &self.facebook {
            if facebook.page_id.trim().is_empty() {
                return Err(ConfigError::MissingField("facebook.page_id".to_string()).into());
            }
        }
        Ok(())
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/syndicast/content.db".to_string(),
            },
            scheduling: SchedulingConfig::default(),
            lock: LockConfig::default(),
            telegram: None,
            vk: None,
            instagram: None,
            facebook: None,
        }
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::SyndicastError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("syndicast").join("config.toml"))
}
