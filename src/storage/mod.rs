//! Storage module for the crawl ledger
//!
//! This module handles all persistence for the engine:
//! - SQLite database initialization and schema management
//! - Websites, schedules and the per-website run lock
//! - Crawl runs and their counters
//! - Page fingerprints and the append-only change history
//! - Notification tasks and in-app notifications
//! - Content-addressed page bodies (see [`BodyStore`])

mod body;
mod schema;
mod sqlite;
mod traits;

pub use body::{BodyStore, FsBodyStore, MemoryBodyStore};
pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::state::{
    ChangeKind, ChangeType, Channel, DeliveryState, PageIssue, PageState, RunStatus, TaskKind,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Storage handle shared by the scheduler, coordinators and dispatcher
///
/// The mutex is never held across an `.await`.
pub type SharedStorage = Arc<Mutex<SqliteStorage>>;

/// Opens (or creates) the ledger at `path` and wraps it for sharing
pub fn open_storage(path: &Path) -> StorageResult<SharedStorage> {
    Ok(Arc::new(Mutex::new(SqliteStorage::new(path)?)))
}

/// Locks the shared storage, mapping a poisoned mutex to an error
pub fn lock_storage(storage: &SharedStorage) -> StorageResult<MutexGuard<'_, SqliteStorage>> {
    storage.lock().map_err(|_| StorageError::LockPoisoned)
}

/// Crawl limits for one website
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlSettings {
    pub max_pages: u32,
    pub max_depth: u32,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    pub concurrency: u32,
    pub respect_robots: bool,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            max_pages: 100,
            max_depth: 3,
            include: Vec::new(),
            exclude: Vec::new(),
            concurrency: 4,
            respect_robots: true,
        }
    }
}

/// A notification channel subscribed to by a website
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSubscription {
    pub channel: Channel,
    /// Email address, webhook URL, or user id for in-app notifications
    pub target: String,
}

/// Notification preferences for one website
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NotificationSettings {
    /// Change events below this severity are not notified
    #[serde(default)]
    pub min_severity: f64,

    /// Notify on run completion even when no change passed the filter
    #[serde(default)]
    pub notify_on_completion: bool,

    #[serde(default = "default_notify_on_failure")]
    pub notify_on_failure: bool,

    #[serde(default)]
    pub channels: Vec<ChannelSubscription>,
}

fn default_notify_on_failure() -> bool {
    true
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            min_severity: 0.0,
            notify_on_completion: false,
            notify_on_failure: true,
            channels: Vec::new(),
        }
    }
}

/// Website definition used to register or update a website
#[derive(Debug, Clone)]
pub struct NewWebsite {
    pub owner_id: i64,
    pub root_url: String,
    pub crawl: CrawlSettings,
    pub notifications: NotificationSettings,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct WebsiteRecord {
    pub id: i64,
    pub owner_id: i64,
    pub root_url: String,
    pub crawl: CrawlSettings,
    pub notifications: NotificationSettings,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WebsiteRecord {
    /// Returns true if the website can be crawled
    pub fn is_crawlable(&self) -> bool {
        self.active && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleRecord {
    pub website_id: i64,
    pub expression: String,
    pub last_run: Option<DateTime<Utc>>,
    pub next_due: DateTime<Utc>,
    pub active: bool,
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub website_id: i64,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub pages_attempted: u32,
    pub pages_succeeded: u32,
    pub pages_failed: u32,
    pub error_message: Option<String>,
}

/// Terminal outcome written by [`Storage::finalize_run`]
#[derive(Debug, Clone)]
pub struct RunFinalization {
    pub status: RunStatus,
    pub pages_attempted: u32,
    pub pages_succeeded: u32,
    pub pages_failed: u32,
    pub error_message: Option<String>,
}

/// Latest known fingerprint of a page
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub id: i64,
    pub website_id: i64,
    pub url: String,
    pub full_hash: String,
    pub structural_hash: Option<String>,
    pub content_length: u64,
    pub state: PageState,
    pub issue: Option<PageIssue>,
    pub last_seen_run: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// A successfully fetched page, written by [`Storage::record_observation`]
#[derive(Debug, Clone)]
pub struct PageObservation {
    pub website_id: i64,
    pub run_id: i64,
    pub url: String,
    pub full_hash: String,
    pub structural_hash: Option<String>,
    pub content_length: u64,
    pub issue: Option<PageIssue>,
    pub observed_at: DateTime<Utc>,
    /// Change detected against the previous record, if any
    pub change: Option<NewChangeEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewChangeEvent {
    pub change_type: ChangeType,
    pub kind: ChangeKind,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub severity: f64,
}

/// Append-only record of a detected change
#[derive(Debug, Clone)]
pub struct ChangeEventRecord {
    pub id: i64,
    pub page_id: i64,
    pub website_id: i64,
    pub run_id: i64,
    pub url: String,
    pub change_type: ChangeType,
    pub kind: ChangeKind,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub severity: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNotificationTask {
    pub website_id: i64,
    pub run_id: i64,
    pub channel: Channel,
    pub target: String,
    pub kind: TaskKind,
    /// Serialized digest payload
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct NotificationTaskRecord {
    pub id: i64,
    pub website_id: i64,
    pub run_id: i64,
    pub channel: Channel,
    pub target: String,
    pub kind: TaskKind,
    pub payload: String,
    pub state: DeliveryState,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct InAppNotification {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub message: String,
    /// JSON document with the digest
    pub data: String,
    pub created_at: DateTime<Utc>,
}

/// What one retention pass removed from the ledger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Body hashes recorded only by runs that ended before the cutoff and no
    /// longer held by any page; the caller deletes them from its body store
    pub stale_body_hashes: Vec<String>,
    pub notification_tasks: u64,
    pub in_app_notifications: u64,
}

/// Aggregate counts over the whole ledger
#[derive(Debug, Clone, Default)]
pub struct LedgerStats {
    pub websites: u64,
    pub active_schedules: u64,
    pub runs_by_status: HashMap<RunStatus, u64>,
    pub pages_by_state: HashMap<PageState, u64>,
    pub degraded_pages: u64,
    pub changes_by_type: HashMap<ChangeType, u64>,
    pub tasks_by_state: HashMap<DeliveryState, u64>,
}
