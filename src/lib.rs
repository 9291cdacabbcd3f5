//! Lapis-Watch: website change detection and incremental crawl scheduling
//!
//! This crate drives repeated crawls of many websites on independent cron
//! schedules, fingerprints every fetched page, classifies changes between
//! crawl generations, and fans detected changes out to notification sinks
//! exactly once per change.

pub mod classifier;
pub mod config;
pub mod crawler;
pub mod engine;
pub mod hasher;
pub mod notify;
pub mod output;
pub mod robots;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for Lapis-Watch operations
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cron error: {0}")]
    Cron(#[from] scheduler::CronError),

    #[error("Website {0} not found")]
    WebsiteNotFound(i64),

    #[error("Systemic failure: {0}")]
    Systemic(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,

    #[error("Malformed URL: {0}")]
    Malformed(String),

    #[error("Invalid URL pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Result type alias for Lapis-Watch operations
pub type Result<T> = std::result::Result<T, WatchError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use classifier::{ChangeClassifier, Classification};
pub use config::Config;
pub use crawler::{Fetcher, RunCoordinator};
pub use hasher::{ContentHasher, Fingerprint};
pub use notify::NotificationDispatcher;
pub use scheduler::{CronExpr, Scheduler};
pub use state::{ChangeType, DeliveryState, RunStatus};
pub use url::normalize_url;
