//! Error types for Syndicast

use thiserror::Error;

use crate::types::ErrorKind;

pub type Result<T> = std::result::Result<T, SyndicastError>;

#[derive(Error, Debug)]
pub enum SyndicastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SyndicastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SyndicastError::InvalidInput(_) | SyndicastError::Validation(_) => 3,
            SyndicastError::Platform(PlatformError::Authentication(_)) => 2,
            SyndicastError::Config(_) => 2,
            SyndicastError::Platform(_) => 1,
            SyndicastError::Database(_) => 1,
            SyndicastError::LeaseLost(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to encode or decode stored document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Failure reported by a platform adapter
///
/// Each variant corresponds to one [`ErrorKind`] persisted on the
/// platform's publication record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Media not ready: {0}")]
    MediaNotReady(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Rejected by platform: {0}")]
    Rejected(String),

    #[error("Platform not configured: {0}")]
    NotConfigured(String),
}

impl PlatformError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlatformError::Authentication(_) => ErrorKind::Auth,
            PlatformError::Network(_) => ErrorKind::TransientNetwork,
            PlatformError::MediaNotReady(_) => ErrorKind::MediaNotReady,
            PlatformError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            PlatformError::Rejected(_) => ErrorKind::Rejected,
            PlatformError::NotConfigured(_) => ErrorKind::NotConfigured,
        }
    }

    /// Whether a later scheduler tick may retry the attempt
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
