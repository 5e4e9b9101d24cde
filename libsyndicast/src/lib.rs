//! Syndicast - scheduled multi-platform content publishing
//!
//! This library holds the publication core: a scheduler that finds due
//! content, lease-based locks that keep one publish attempt per item across
//! processes, an orchestrator that tracks each platform's outcome, and a
//! markup sanitizer that renders one rich-text body in every platform's
//! dialect.

pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod platforms;
pub mod rate_limiter;
pub mod sanitizer;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::{Database, DueItems, SaveOutcome};
pub use error::{PlatformError, Result, SyndicastError};
pub use lock::{Lease, LockManager};
pub use orchestrator::{AttemptOutcome, Disposition, PublishOrchestrator, PublishReport, RetryPolicy};
pub use platforms::{create_platforms, Platform, PlatformRegistry};
pub use scheduler::{Scheduler, TickReport};
pub use types::{
    ContentItem, ContentStatus, ErrorKind, MediaRef, PlatformKind, PlatformPublication,
    PublicationStatus,
};
