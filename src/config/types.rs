use crate::storage::NotificationSettings;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Lapis-Watch
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub hasher: HasherConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    pub storage: StorageConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(default, rename = "website")]
    pub websites: Vec<WebsiteEntry>,
}

/// Scheduler timer and run admission
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks in daemon mode
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Advisory cap on pending + running crawl runs across all websites
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: u32,

    /// Lease on a website's run lock; an expired lease is reclaimed by the next tick
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
            lock_lease_secs: default_lock_lease_secs(),
        }
    }
}

/// Per-run fetch behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Wall-clock limit for one run; reaching it cancels the run
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl RunConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Longest a run can hold its lock before it stops writing
    ///
    /// A run that hits its timeout still drains fetches already in flight,
    /// each of which may exhaust its attempts and back off between them.
    pub fn max_run_secs(&self) -> u64 {
        let attempts = u64::from(self.max_fetch_attempts);
        let retry_max_delay_secs = (self.retry_max_delay_ms + 999) / 1000;
        self.run_timeout_secs
            + self.fetch_timeout_secs * (attempts + 1)
            + retry_max_delay_secs * attempts
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            max_fetch_attempts: default_max_fetch_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Content normalization rules used before hashing
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HasherConfig {
    /// Drop text inside script, style and noscript elements
    #[serde(default = "default_true")]
    pub ignore_script_content: bool,

    /// Attribute names removed before hashing (any name containing "csrf" is always removed)
    #[serde(default = "default_volatile_attributes")]
    pub volatile_attributes: Vec<String>,

    /// Regexes; attribute values matching any of them are removed before hashing
    #[serde(default = "default_volatile_patterns")]
    pub volatile_patterns: Vec<String>,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            ignore_script_content: true,
            volatile_attributes: default_volatile_attributes(),
            volatile_patterns: default_volatile_patterns(),
        }
    }
}

/// Severity scoring parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClassifierConfig {
    #[serde(default = "default_content_weight")]
    pub content_weight: f64,

    #[serde(default = "default_minor_floor")]
    pub minor_floor: f64,

    #[serde(default = "default_content_ceiling")]
    pub content_ceiling: f64,

    #[serde(default = "default_structural_severity")]
    pub structural_severity: f64,

    #[serde(default = "default_removed_severity")]
    pub removed_severity: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            content_weight: default_content_weight(),
            minor_floor: default_minor_floor(),
            content_ceiling: default_content_ceiling(),
            structural_severity: default_structural_severity(),
            removed_severity: default_removed_severity(),
        }
    }
}

/// Notification delivery loop
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NotificationsConfig {
    #[serde(default = "default_delivery_interval_secs")]
    pub delivery_interval_secs: u64,

    /// Attempts before a task becomes failed-permanent
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: u32,

    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    /// HMAC-SHA256 key used to sign webhook bodies
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl NotificationsConfig {
    pub fn delivery_interval(&self) -> Duration {
        Duration::from_secs(self.delivery_interval_secs)
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            delivery_interval_secs: default_delivery_interval_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
            webhook_secret: None,
        }
    }
}

/// Persistence locations
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Directory for content-addressed page bodies; bodies are not kept when unset
    #[serde(rename = "body-store-path", default)]
    pub body_store_path: Option<String>,

    /// Age after which run artifacts and delivered notifications are pruned;
    /// 0 keeps everything
    #[serde(rename = "retention-days", default = "default_retention_days")]
    pub retention_days: u32,
}

impl StorageConfig {
    /// How long run artifacts are kept, `None` when pruning is disabled
    pub fn retention(&self) -> Option<chrono::Duration> {
        match self.retention_days {
            0 => None,
            days => Some(chrono::Duration::days(i64::from(days))),
        }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

/// A monitored website
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WebsiteEntry {
    /// Root URL the crawl starts from
    pub url: String,

    /// Owning user id
    #[serde(default = "default_owner_id")]
    pub owner_id: i64,

    /// Cron expression, cron macro, or one of "hourly", "daily", "weekly"
    #[serde(default = "default_schedule")]
    pub schedule: String,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// URL glob patterns a page must match (all pages when empty)
    #[serde(default)]
    pub include: Vec<String>,

    /// URL glob patterns that exclude a page
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    #[serde(default = "default_true")]
    pub respect_robots: bool,

    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default)]
    pub notifications: NotificationSettings,
}

fn default_true() -> bool {
    true
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_max_concurrent_runs() -> u32 {
    8
}

fn default_lock_lease_secs() -> u64 {
    2 * 60 * 60
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_run_timeout_secs() -> u64 {
    60 * 60
}

fn default_max_fetch_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

pub(crate) fn default_volatile_attributes() -> Vec<String> {
    [
        "nonce",
        "integrity",
        "csrf-token",
        "data-csrf",
        "data-timestamp",
        "data-ad-slot",
        "data-request-id",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub(crate) fn default_volatile_patterns() -> Vec<String> {
    vec![
        // ISO-8601 timestamps
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})?".to_string(),
        // Unix epoch seconds or milliseconds
        r"^\d{10}(\d{3})?$".to_string(),
    ]
}

fn default_content_weight() -> f64 {
    1.0
}

fn default_minor_floor() -> f64 {
    0.1
}

fn default_content_ceiling() -> f64 {
    0.6
}

fn default_structural_severity() -> f64 {
    0.9
}

fn default_removed_severity() -> f64 {
    0.9
}

fn default_delivery_interval_secs() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    30
}

fn default_backoff_max_secs() -> u64 {
    60 * 60
}

fn default_max_concurrent_deliveries() -> u32 {
    4
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_retention_days() -> u32 {
    90
}

fn default_owner_id() -> i64 {
    1
}

fn default_schedule() -> String {
    "daily".to_string()
}

fn default_max_pages() -> u32 {
    100
}

fn default_max_depth() -> u32 {
    3
}

fn default_concurrency() -> u32 {
    4
}
