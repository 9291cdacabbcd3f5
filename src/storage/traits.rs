//! Storage traits and error types
//!
//! This module defines the trait interface for the relational ledger and
//! its error type.

use crate::state::RunStatus;
use crate::storage::{
    ChangeEventRecord, InAppNotification, LedgerStats, NewChangeEvent, NewNotificationTask,
    NewWebsite, NotificationTaskRecord, PageObservation, PageRecord, PruneReport,
    RunFinalization, RunRecord, ScheduleRecord, WebsiteRecord,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Website not found: {0}")]
    WebsiteNotFound(i64),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Invalid run transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: i64,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Run {0} no longer holds its website's lock")]
    LeaseLost(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Relational ledger shared by the scheduler, run coordinator and dispatcher
///
/// Every method that touches more than one row runs in a single transaction.
pub trait Storage {
    // ===== Websites & Schedules =====

    /// Registers a website or updates the one with the same root URL
    ///
    /// A soft-deleted website is revived. The schedule row is created when
    /// missing; when `expression` differs from the stored one, the expression
    /// and `next_due` are replaced. The schedule's active flag is set from the
    /// website's only when the schedule is created, its expression changes,
    /// or the website's flag changes.
    ///
    /// # Returns
    ///
    /// The website ID
    fn upsert_website(
        &mut self,
        website: &NewWebsite,
        expression: &str,
        next_due: DateTime<Utc>,
    ) -> StorageResult<i64>;

    fn get_website(&self, website_id: i64) -> StorageResult<Option<WebsiteRecord>>;

    /// Lists websites that are not soft-deleted
    fn list_websites(&self) -> StorageResult<Vec<WebsiteRecord>>;

    /// Deactivates the website and deletes its schedule; crawl history is kept
    fn soft_delete_website(&mut self, website_id: i64, now: DateTime<Utc>) -> StorageResult<()>;

    fn get_schedule(&self, website_id: i64) -> StorageResult<Option<ScheduleRecord>>;

    /// Active schedules of crawlable websites with `next_due <= now`, oldest first
    fn due_schedules(&self, now: DateTime<Utc>) -> StorageResult<Vec<ScheduleRecord>>;

    fn set_schedule_active(&mut self, website_id: i64, active: bool) -> StorageResult<()>;

    // ===== Runs =====

    /// Number of pending and running runs across all websites
    fn count_active_runs(&self) -> StorageResult<u32>;

    /// Atomically acquires the website's run lock, creates a pending run and
    /// advances the schedule
    ///
    /// # Returns
    ///
    /// * `Ok(Some(run))` - The lock was acquired and the run created
    /// * `Ok(None)` - Another run holds the lock; nothing was written
    fn begin_run(
        &mut self,
        website_id: i64,
        now: DateTime<Utc>,
        next_due: Option<DateTime<Utc>>,
        lease_expires_at: DateTime<Utc>,
    ) -> StorageResult<Option<RunRecord>>;

    /// Moves a pending run to running
    fn mark_run_running(&mut self, run_id: i64, now: DateTime<Utc>) -> StorageResult<()>;

    /// Writes the terminal status and counters and releases the run lock
    ///
    /// # Returns
    ///
    /// `false` when the run was already terminal (e.g. its lease was reclaimed)
    fn finalize_run(
        &mut self,
        run_id: i64,
        outcome: &RunFinalization,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Fails runs whose lock lease expired and releases their locks
    ///
    /// # Returns
    ///
    /// IDs of the runs that were failed
    fn reclaim_expired_locks(&mut self, now: DateTime<Utc>) -> StorageResult<Vec<i64>>;

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Most recent runs of a website, newest first
    fn list_runs(&self, website_id: i64, limit: u32) -> StorageResult<Vec<RunRecord>>;

    // ===== Pages & Changes =====

    fn count_pages(&self, website_id: i64) -> StorageResult<u64>;

    fn get_page(&self, website_id: i64, url: &str) -> StorageResult<Option<PageRecord>>;

    fn list_pages(&self, website_id: i64) -> StorageResult<Vec<PageRecord>>;

    /// Upserts the page fingerprint and appends the change event in one transaction
    ///
    /// The page becomes live with `last_seen_run = run_id`. At most one event
    /// exists per page and run; a duplicate is ignored.
    ///
    /// # Returns
    ///
    /// The change event that was written, if any, or
    /// `Err(StorageError::LeaseLost)` when the run no longer holds the
    /// website's lock (nothing written)
    fn record_observation(
        &mut self,
        observation: &PageObservation,
    ) -> StorageResult<Option<ChangeEventRecord>>;

    /// Tombstones a live page and appends its removal event in one transaction
    ///
    /// # Returns
    ///
    /// `None` if the page was not live (nothing written), or
    /// `Err(StorageError::LeaseLost)` when the run no longer holds the
    /// website's lock
    fn tombstone_page(
        &mut self,
        page_id: i64,
        run_id: i64,
        change: &NewChangeEvent,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ChangeEventRecord>>;

    fn run_change_events(&self, run_id: i64) -> StorageResult<Vec<ChangeEventRecord>>;

    /// Change history of one page, oldest first
    fn page_change_events(&self, page_id: i64) -> StorageResult<Vec<ChangeEventRecord>>;

    // ===== Notifications =====

    /// Queues a notification task; a duplicate (run, channel, target) is ignored
    fn insert_notification_task(
        &mut self,
        task: &NewNotificationTask,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<NotificationTaskRecord>>;

    /// Queued and failed-retryable tasks with `next_attempt_at <= now`
    fn due_notification_tasks(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StorageResult<Vec<NotificationTaskRecord>>;

    fn run_notification_tasks(&self, run_id: i64) -> StorageResult<Vec<NotificationTaskRecord>>;

    fn mark_task_sent(&mut self, task_id: i64, now: DateTime<Utc>) -> StorageResult<()>;

    fn mark_task_retryable(
        &mut self,
        task_id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    fn mark_task_failed(&mut self, task_id: i64, error: &str) -> StorageResult<()>;

    /// Tasks that exhausted delivery; surfaced as operational alerts
    fn failed_notification_tasks(&self) -> StorageResult<Vec<NotificationTaskRecord>>;

    fn insert_in_app_notification(
        &mut self,
        user_id: i64,
        title: &str,
        message: &str,
        data: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<i64>;

    fn list_in_app_notifications(&self, user_id: i64) -> StorageResult<Vec<InAppNotification>>;

    // ===== Retention =====

    /// Drops delivery artifacts older than `cutoff`
    ///
    /// Deletes notification tasks sent before the cutoff and in-app
    /// notifications created before it. Runs, pages and change events are
    /// kept; the body hashes only those old runs still reference are
    /// reported for removal from the body store.
    fn prune_before(&mut self, cutoff: DateTime<Utc>) -> StorageResult<PruneReport>;

    // ===== Statistics =====

    fn ledger_stats(&self) -> StorageResult<LedgerStats>;
}
