//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::state::{
    ChangeKind, ChangeType, Channel, DeliveryState, PageIssue, PageState, RunStatus, TaskKind,
};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    ChangeEventRecord, InAppNotification, LedgerStats, NewChangeEvent, NewNotificationTask,
    NewWebsite, NotificationTaskRecord, PageObservation, PageRecord, PruneReport,
    RunFinalization, RunRecord, ScheduleRecord, WebsiteRecord,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::hash::Hash;
use std::path::Path;

const WEBSITE_COLUMNS: &str = "id, owner_id, root_url, crawl_settings, notification_settings, \
     active, created_at, deleted_at";

const SCHEDULE_COLUMNS: &str = "website_id, expression, last_run, next_due, active";

const RUN_COLUMNS: &str = "id, website_id, status, created_at, started_at, ended_at, \
     pages_attempted, pages_succeeded, pages_failed, error_message";

const PAGE_COLUMNS: &str = "id, website_id, url, full_hash, structural_hash, content_length, \
     state, issue, last_seen_run, first_seen_at, last_modified";

const CHANGE_COLUMNS: &str = "id, page_id, website_id, run_id, url, change_type, change_kind, \
     old_hash, new_hash, severity, detected_at";

const TASK_COLUMNS: &str = "id, website_id, run_id, channel, target, kind, payload, state, \
     attempt_count, next_attempt_at, last_error, created_at, delivered_at";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Opens or creates the database at `path`
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for tests and dry runs)
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn count_by<T: Eq + Hash>(
        &self,
        sql: &str,
        parse: fn(&str) -> Option<T>,
    ) -> StorageResult<HashMap<T, u64>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (key, count) = row?;
            if let Some(key) = parse(&key) {
                counts.insert(key, count as u64);
            }
        }
        Ok(counts)
    }

    fn count(&self, sql: &str) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl Storage for SqliteStorage {
    // ===== Websites & Schedules =====

    fn upsert_website(
        &mut self,
        website: &NewWebsite,
        expression: &str,
        next_due: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let crawl = serde_json::to_string(&website.crawl)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let notifications = serde_json::to_string(&website.notifications)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let tx = self.conn.transaction()?;
        let previous_active: Option<bool> = tx
            .query_row(
                "SELECT active FROM websites WHERE root_url = ?1",
                params![website.root_url],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO websites (owner_id, root_url, crawl_settings, notification_settings, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(root_url) DO UPDATE SET
                owner_id = excluded.owner_id,
                crawl_settings = excluded.crawl_settings,
                notification_settings = excluded.notification_settings,
                active = excluded.active,
                deleted_at = NULL",
            params![
                website.owner_id,
                website.root_url,
                crawl,
                notifications,
                website.active,
                ts(Utc::now())
            ],
        )?;

        let website_id: i64 = tx.query_row(
            "SELECT id FROM websites WHERE root_url = ?1",
            params![website.root_url],
            |row| row.get(0),
        )?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT expression FROM schedules WHERE website_id = ?1",
                params![website_id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO schedules (website_id, expression, next_due, active) VALUES (?1, ?2, ?3, ?4)",
                    params![website_id, expression, ts(next_due), website.active],
                )?;
            }
            Some(current) if current != expression => {
                tx.execute(
                    "UPDATE schedules SET expression = ?2, next_due = ?3, active = ?4 WHERE website_id = ?1",
                    params![website_id, expression, ts(next_due), website.active],
                )?;
            }
            // A schedule deactivated for having no future occurrence stays
            // off until the website's own active flag changes
            Some(_) if previous_active != Some(website.active) => {
                tx.execute(
                    "UPDATE schedules SET active = ?2 WHERE website_id = ?1",
                    params![website_id, website.active],
                )?;
            }
            Some(_) => {}
        }

        tx.commit()?;
        Ok(website_id)
    }

    fn get_website(&self, website_id: i64) -> StorageResult<Option<WebsiteRecord>> {
        let website = self
            .conn
            .query_row(
                &format!("SELECT {} FROM websites WHERE id = ?1", WEBSITE_COLUMNS),
                params![website_id],
                website_from_row,
            )
            .optional()?;
        Ok(website)
    }

    fn list_websites(&self) -> StorageResult<Vec<WebsiteRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM websites WHERE deleted_at IS NULL ORDER BY id",
            WEBSITE_COLUMNS
        ))?;
        let websites = stmt
            .query_map([], website_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(websites)
    }

    fn soft_delete_website(&mut self, website_id: i64, now: DateTime<Utc>) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE websites SET active = 0, deleted_at = COALESCE(deleted_at, ?2) WHERE id = ?1",
            params![website_id, ts(now)],
        )?;
        if updated == 0 {
            return Err(StorageError::WebsiteNotFound(website_id));
        }
        tx.execute(
            "DELETE FROM schedules WHERE website_id = ?1",
            params![website_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_schedule(&self, website_id: i64) -> StorageResult<Option<ScheduleRecord>> {
        let schedule = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM schedules WHERE website_id = ?1",
                    SCHEDULE_COLUMNS
                ),
                params![website_id],
                schedule_from_row,
            )
            .optional()?;
        Ok(schedule)
    }

    fn due_schedules(&self, now: DateTime<Utc>) -> StorageResult<Vec<ScheduleRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.website_id, s.expression, s.last_run, s.next_due, s.active
             FROM schedules s
             JOIN websites w ON w.id = s.website_id
             WHERE s.active = 1 AND w.active = 1 AND w.deleted_at IS NULL AND s.next_due <= ?1
             ORDER BY s.next_due, s.website_id",
        )?;
        let schedules = stmt
            .query_map(params![ts(now)], schedule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(schedules)
    }

    fn set_schedule_active(&mut self, website_id: i64, active: bool) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE schedules SET active = ?2 WHERE website_id = ?1",
            params![website_id, active],
        )?;
        if updated == 0 {
            return Err(StorageError::WebsiteNotFound(website_id));
        }
        Ok(())
    }

    // ===== Runs =====

    fn count_active_runs(&self) -> StorageResult<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE status IN ('pending', 'running')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    fn begin_run(
        &mut self,
        website_id: i64,
        now: DateTime<Utc>,
        next_due: Option<DateTime<Utc>>,
        lease_expires_at: DateTime<Utc>,
    ) -> StorageResult<Option<RunRecord>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let held: Option<i64> = tx
            .query_row(
                "SELECT run_id FROM run_locks WHERE website_id = ?1",
                params![website_id],
                |row| row.get(0),
            )
            .optional()?;
        if held.is_some() {
            // Dropping the transaction rolls it back
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO runs (website_id, status, created_at) VALUES (?1, ?2, ?3)",
            params![website_id, RunStatus::Pending.to_db_string(), ts(now)],
        )?;
        let run_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO run_locks (website_id, run_id, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![website_id, run_id, ts(now), ts(lease_expires_at)],
        )?;

        // An expression with no future occurrence deactivates the schedule
        tx.execute(
            "UPDATE schedules SET
                last_run = ?2,
                next_due = COALESCE(?3, next_due),
                active = CASE WHEN ?3 IS NULL THEN 0 ELSE active END
             WHERE website_id = ?1",
            params![website_id, ts(now), next_due.map(ts)],
        )?;

        tx.commit()?;

        Ok(Some(RunRecord {
            id: run_id,
            website_id,
            status: RunStatus::Pending,
            created_at: now,
            started_at: None,
            ended_at: None,
            pages_attempted: 0,
            pages_succeeded: 0,
            pages_failed: 0,
            error_message: None,
        }))
    }

    fn mark_run_running(&mut self, run_id: i64, now: DateTime<Utc>) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?2, started_at = ?3 WHERE id = ?1 AND status = ?4",
            params![
                run_id,
                RunStatus::Running.to_db_string(),
                ts(now),
                RunStatus::Pending.to_db_string()
            ],
        )?;

        if updated == 0 {
            let current = self.get_run(run_id)?;
            return Err(StorageError::InvalidTransition {
                run_id,
                from: current.status,
                to: RunStatus::Running,
            });
        }
        Ok(())
    }

    fn finalize_run(
        &mut self,
        run_id: i64,
        outcome: &RunFinalization,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        if !outcome.status.is_terminal() {
            return Err(StorageError::InvalidTransition {
                run_id,
                from: RunStatus::Running,
                to: outcome.status,
            });
        }

        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE runs SET status = ?2, ended_at = ?3, pages_attempted = ?4, pages_succeeded = ?5,
                pages_failed = ?6, error_message = ?7
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![
                run_id,
                outcome.status.to_db_string(),
                ts(now),
                outcome.pages_attempted,
                outcome.pages_succeeded,
                outcome.pages_failed,
                outcome.error_message
            ],
        )?;
        tx.execute("DELETE FROM run_locks WHERE run_id = ?1", params![run_id])?;
        tx.commit()?;

        Ok(updated > 0)
    }

    fn reclaim_expired_locks(&mut self, now: DateTime<Utc>) -> StorageResult<Vec<i64>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let expired: Vec<(i64, i64)> = {
            let mut stmt =
                tx.prepare("SELECT website_id, run_id FROM run_locks WHERE expires_at <= ?1")?;
            let rows = stmt.query_map(params![ts(now)], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for (website_id, run_id) in &expired {
            tx.execute(
                "UPDATE runs SET status = ?2, ended_at = ?3, error_message = 'run lease expired'
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![run_id, RunStatus::Failed.to_db_string(), ts(now)],
            )?;
            tx.execute(
                "DELETE FROM run_locks WHERE website_id = ?1",
                params![website_id],
            )?;
        }

        tx.commit()?;
        Ok(expired.into_iter().map(|(_, run_id)| run_id).collect())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id],
                run_from_row,
            )
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn list_runs(&self, website_id: i64, limit: u32) -> StorageResult<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM runs WHERE website_id = ?1 ORDER BY id DESC LIMIT ?2",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![website_id, limit], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    // ===== Pages & Changes =====

    fn count_pages(&self, website_id: i64) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pages WHERE website_id = ?1",
            params![website_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn get_page(&self, website_id: i64, url: &str) -> StorageResult<Option<PageRecord>> {
        let page = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM pages WHERE website_id = ?1 AND url = ?2",
                    PAGE_COLUMNS
                ),
                params![website_id, url],
                page_from_row,
            )
            .optional()?;
        Ok(page)
    }

    fn list_pages(&self, website_id: i64) -> StorageResult<Vec<PageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM pages WHERE website_id = ?1 ORDER BY id",
            PAGE_COLUMNS
        ))?;
        let pages = stmt
            .query_map(params![website_id], page_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pages)
    }

    fn record_observation(
        &mut self,
        observation: &PageObservation,
    ) -> StorageResult<Option<ChangeEventRecord>> {
        let observed_at = ts(observation.observed_at);
        let issue = observation.issue.map(|i| i.to_db_string());

        let tx = self.conn.transaction()?;
        ensure_lock_held(&tx, observation.website_id, observation.run_id)?;

        let existing: Option<(i64, String, Option<String>, String)> = tx
            .query_row(
                "SELECT id, full_hash, structural_hash, state FROM pages WHERE website_id = ?1 AND url = ?2",
                params![observation.website_id, observation.url],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let page_id = match existing {
            None => {
                tx.execute(
                    "INSERT INTO pages (website_id, url, full_hash, structural_hash, content_length, state,
                        issue, last_seen_run, first_seen_at, last_modified)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        observation.website_id,
                        observation.url,
                        observation.full_hash,
                        observation.structural_hash,
                        observation.content_length as i64,
                        PageState::Live.to_db_string(),
                        issue,
                        observation.run_id,
                        observed_at
                    ],
                )?;
                tx.last_insert_rowid()
            }
            Some((page_id, full_hash, structural_hash, state)) => {
                let modified = full_hash != observation.full_hash
                    || structural_hash != observation.structural_hash
                    || state != PageState::Live.to_db_string();
                tx.execute(
                    "UPDATE pages SET full_hash = ?2, structural_hash = ?3, content_length = ?4, state = ?5,
                        issue = ?6, last_seen_run = ?7,
                        last_modified = CASE WHEN ?8 THEN ?9 ELSE last_modified END
                     WHERE id = ?1",
                    params![
                        page_id,
                        observation.full_hash,
                        observation.structural_hash,
                        observation.content_length as i64,
                        PageState::Live.to_db_string(),
                        issue,
                        observation.run_id,
                        modified,
                        observed_at
                    ],
                )?;
                page_id
            }
        };

        let event = match &observation.change {
            Some(change) => insert_change_event(
                &tx,
                page_id,
                observation.website_id,
                observation.run_id,
                &observation.url,
                change,
                observation.observed_at,
            )?,
            None => None,
        };

        tx.commit()?;
        Ok(event)
    }

    fn tombstone_page(
        &mut self,
        page_id: i64,
        run_id: i64,
        change: &NewChangeEvent,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ChangeEventRecord>> {
        let tx = self.conn.transaction()?;

        let live: Option<(i64, String)> = tx
            .query_row(
                "SELECT website_id, url FROM pages WHERE id = ?1 AND state = ?2",
                params![page_id, PageState::Live.to_db_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((website_id, url)) = live else {
            return Ok(None);
        };
        ensure_lock_held(&tx, website_id, run_id)?;

        tx.execute(
            "UPDATE pages SET state = ?2, last_modified = ?3 WHERE id = ?1",
            params![page_id, PageState::Tombstoned.to_db_string(), ts(now)],
        )?;

        let event = insert_change_event(&tx, page_id, website_id, run_id, &url, change, now)?;
        tx.commit()?;
        Ok(event)
    }

    fn run_change_events(&self, run_id: i64) -> StorageResult<Vec<ChangeEventRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM change_events WHERE run_id = ?1 ORDER BY id",
            CHANGE_COLUMNS
        ))?;
        let events = stmt
            .query_map(params![run_id], change_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn page_change_events(&self, page_id: i64) -> StorageResult<Vec<ChangeEventRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM change_events WHERE page_id = ?1 ORDER BY id",
            CHANGE_COLUMNS
        ))?;
        let events = stmt
            .query_map(params![page_id], change_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ===== Notifications =====

    fn insert_notification_task(
        &mut self,
        task: &NewNotificationTask,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<NotificationTaskRecord>> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO notification_tasks
                (website_id, run_id, channel, target, kind, payload, state, next_attempt_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                task.website_id,
                task.run_id,
                task.channel.to_db_string(),
                task.target,
                task.kind.to_db_string(),
                task.payload,
                DeliveryState::Queued.to_db_string(),
                ts(now)
            ],
        )?;

        if inserted == 0 {
            return Ok(None);
        }

        Ok(Some(NotificationTaskRecord {
            id: self.conn.last_insert_rowid(),
            website_id: task.website_id,
            run_id: task.run_id,
            channel: task.channel,
            target: task.target.clone(),
            kind: task.kind,
            payload: task.payload.clone(),
            state: DeliveryState::Queued,
            attempt_count: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            delivered_at: None,
        }))
    }

    fn due_notification_tasks(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StorageResult<Vec<NotificationTaskRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM notification_tasks
             WHERE state IN ('queued', 'failed_retryable') AND next_attempt_at <= ?1
             ORDER BY next_attempt_at, id LIMIT ?2",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![ts(now), limit], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn run_notification_tasks(&self, run_id: i64) -> StorageResult<Vec<NotificationTaskRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM notification_tasks WHERE run_id = ?1 ORDER BY id",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![run_id], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn mark_task_sent(&mut self, task_id: i64, now: DateTime<Utc>) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE notification_tasks SET state = ?2, attempt_count = attempt_count + 1,
                delivered_at = ?3, last_error = NULL
             WHERE id = ?1",
            params![task_id, DeliveryState::Sent.to_db_string(), ts(now)],
        )?;
        Ok(())
    }

    fn mark_task_retryable(
        &mut self,
        task_id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE notification_tasks SET state = ?2, attempt_count = attempt_count + 1,
                last_error = ?3, next_attempt_at = ?4
             WHERE id = ?1",
            params![
                task_id,
                DeliveryState::FailedRetryable.to_db_string(),
                error,
                ts(next_attempt_at)
            ],
        )?;
        Ok(())
    }

    fn mark_task_failed(&mut self, task_id: i64, error: &str) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE notification_tasks SET state = ?2, attempt_count = attempt_count + 1, last_error = ?3
             WHERE id = ?1",
            params![task_id, DeliveryState::FailedPermanent.to_db_string(), error],
        )?;
        Ok(())
    }

    fn failed_notification_tasks(&self) -> StorageResult<Vec<NotificationTaskRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM notification_tasks WHERE state = ?1 ORDER BY id",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(
                params![DeliveryState::FailedPermanent.to_db_string()],
                task_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn insert_in_app_notification(
        &mut self,
        user_id: i64,
        title: &str,
        message: &str,
        data: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO in_app_notifications (user_id, title, message, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, title, message, data, ts(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_in_app_notifications(&self, user_id: i64) -> StorageResult<Vec<InAppNotification>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, title, message, data, created_at
             FROM in_app_notifications WHERE user_id = ?1 ORDER BY id",
        )?;
        let notifications = stmt
            .query_map(params![user_id], |row| {
                Ok(InAppNotification {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    title: row.get(2)?,
                    message: row.get(3)?,
                    data: row.get(4)?,
                    created_at: parse_ts(5, row.get(5)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notifications)
    }

    // ===== Retention =====

    fn prune_before(&mut self, cutoff: DateTime<Utc>) -> StorageResult<PruneReport> {
        let cutoff = ts(cutoff);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Hashes of old terminal runs that neither a page nor a newer or
        // unfinished run still refers to
        let stale_body_hashes = {
            let mut stmt = tx.prepare(
                "WITH hashes AS (
                    SELECT ce.run_id, ce.old_hash AS hash FROM change_events ce
                    UNION
                    SELECT ce.run_id, ce.new_hash AS hash FROM change_events ce
                 ),
                 old_runs AS (
                    SELECT id FROM runs
                    WHERE status NOT IN ('pending', 'running') AND ended_at < ?1
                 )
                 SELECT DISTINCT hash FROM hashes
                 WHERE hash IS NOT NULL
                   AND run_id IN (SELECT id FROM old_runs)
                   AND hash NOT IN (SELECT full_hash FROM pages)
                   AND hash NOT IN (
                       SELECT hash FROM hashes
                       WHERE hash IS NOT NULL AND run_id NOT IN (SELECT id FROM old_runs)
                   )
                 ORDER BY hash",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let notification_tasks = tx.execute(
            "DELETE FROM notification_tasks WHERE state = ?1 AND delivered_at < ?2",
            params![DeliveryState::Sent.to_db_string(), cutoff],
        )?;
        let in_app_notifications = tx.execute(
            "DELETE FROM in_app_notifications WHERE created_at < ?1",
            params![cutoff],
        )?;

        tx.commit()?;
        Ok(PruneReport {
            stale_body_hashes,
            notification_tasks: notification_tasks as u64,
            in_app_notifications: in_app_notifications as u64,
        })
    }

    // ===== Statistics =====

    fn ledger_stats(&self) -> StorageResult<LedgerStats> {
        Ok(LedgerStats {
            websites: self.count("SELECT COUNT(*) FROM websites WHERE deleted_at IS NULL")?,
            active_schedules: self.count("SELECT COUNT(*) FROM schedules WHERE active = 1")?,
            runs_by_status: self.count_by(
                "SELECT status, COUNT(*) FROM runs GROUP BY status",
                RunStatus::from_db_string,
            )?,
            pages_by_state: self.count_by(
                "SELECT state, COUNT(*) FROM pages GROUP BY state",
                PageState::from_db_string,
            )?,
            degraded_pages: self.count("SELECT COUNT(*) FROM pages WHERE issue IS NOT NULL")?,
            changes_by_type: self.count_by(
                "SELECT change_type, COUNT(*) FROM change_events GROUP BY change_type",
                ChangeType::from_db_string,
            )?,
            tasks_by_state: self.count_by(
                "SELECT state, COUNT(*) FROM notification_tasks GROUP BY state",
                DeliveryState::from_db_string,
            )?,
        })
    }
}

/// Fails with `LeaseLost` unless `run_id` holds the website's run lock
fn ensure_lock_held(conn: &Connection, website_id: i64, run_id: i64) -> StorageResult<()> {
    let holder: Option<i64> = conn
        .query_row(
            "SELECT run_id FROM run_locks WHERE website_id = ?1",
            params![website_id],
            |row| row.get(0),
        )
        .optional()?;
    if holder == Some(run_id) {
        Ok(())
    } else {
        Err(StorageError::LeaseLost(run_id))
    }
}

fn insert_change_event(
    conn: &Connection,
    page_id: i64,
    website_id: i64,
    run_id: i64,
    url: &str,
    change: &NewChangeEvent,
    detected_at: DateTime<Utc>,
) -> StorageResult<Option<ChangeEventRecord>> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO change_events
            (page_id, website_id, run_id, url, change_type, change_kind, old_hash, new_hash, severity, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            page_id,
            website_id,
            run_id,
            url,
            change.change_type.to_db_string(),
            change.kind.to_db_string(),
            change.old_hash,
            change.new_hash,
            change.severity,
            ts(detected_at)
        ],
    )?;

    if inserted == 0 {
        return Ok(None);
    }

    Ok(Some(ChangeEventRecord {
        id: conn.last_insert_rowid(),
        page_id,
        website_id,
        run_id,
        url: url.to_string(),
        change_type: change.change_type,
        kind: change.kind,
        old_hash: change.old_hash.clone(),
        new_hash: change.new_hash.clone(),
        severity: change.severity,
        detected_at,
    }))
}

/// Formats a timestamp in the fixed-width form stored in the database
fn ts(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(idx, v)).transpose()
}

fn parse_enum<T>(idx: usize, value: String, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown value '{}'", value).into(),
        )
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, value: String) -> rusqlite::Result<T> {
    serde_json::from_str(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn website_from_row(row: &Row<'_>) -> rusqlite::Result<WebsiteRecord> {
    Ok(WebsiteRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        root_url: row.get(2)?,
        crawl: parse_json(3, row.get(3)?)?,
        notifications: parse_json(4, row.get(4)?)?,
        active: row.get(5)?,
        created_at: parse_ts(6, row.get(6)?)?,
        deleted_at: parse_opt_ts(7, row.get(7)?)?,
    })
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRecord> {
    Ok(ScheduleRecord {
        website_id: row.get(0)?,
        expression: row.get(1)?,
        last_run: parse_opt_ts(2, row.get(2)?)?,
        next_due: parse_ts(3, row.get(3)?)?,
        active: row.get(4)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        website_id: row.get(1)?,
        status: parse_enum(2, row.get(2)?, RunStatus::from_db_string)?,
        created_at: parse_ts(3, row.get(3)?)?,
        started_at: parse_opt_ts(4, row.get(4)?)?,
        ended_at: parse_opt_ts(5, row.get(5)?)?,
        pages_attempted: row.get(6)?,
        pages_succeeded: row.get(7)?,
        pages_failed: row.get(8)?,
        error_message: row.get(9)?,
    })
}

fn page_from_row(row: &Row<'_>) -> rusqlite::Result<PageRecord> {
    let issue: Option<String> = row.get(7)?;
    Ok(PageRecord {
        id: row.get(0)?,
        website_id: row.get(1)?,
        url: row.get(2)?,
        full_hash: row.get(3)?,
        structural_hash: row.get(4)?,
        content_length: row.get::<_, i64>(5)?.max(0) as u64,
        state: parse_enum(6, row.get(6)?, PageState::from_db_string)?,
        issue: issue
            .map(|i| parse_enum(7, i, PageIssue::from_db_string))
            .transpose()?,
        last_seen_run: row.get(8)?,
        first_seen_at: parse_ts(9, row.get(9)?)?,
        last_modified: parse_ts(10, row.get(10)?)?,
    })
}

fn change_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeEventRecord> {
    Ok(ChangeEventRecord {
        id: row.get(0)?,
        page_id: row.get(1)?,
        website_id: row.get(2)?,
        run_id: row.get(3)?,
        url: row.get(4)?,
        change_type: parse_enum(5, row.get(5)?, ChangeType::from_db_string)?,
        kind: parse_enum(6, row.get(6)?, ChangeKind::from_db_string)?,
        old_hash: row.get(7)?,
        new_hash: row.get(8)?,
        severity: row.get(9)?,
        detected_at: parse_ts(10, row.get(10)?)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationTaskRecord> {
    Ok(NotificationTaskRecord {
        id: row.get(0)?,
        website_id: row.get(1)?,
        run_id: row.get(2)?,
        channel: parse_enum(3, row.get(3)?, Channel::from_db_string)?,
        target: row.get(4)?,
        kind: parse_enum(5, row.get(5)?, TaskKind::from_db_string)?,
        payload: row.get(6)?,
        state: parse_enum(7, row.get(7)?, DeliveryState::from_db_string)?,
        attempt_count: row.get(8)?,
        next_attempt_at: parse_ts(9, row.get(9)?)?,
        last_error: row.get(10)?,
        created_at: parse_ts(11, row.get(11)?)?,
        delivered_at: parse_opt_ts(12, row.get(12)?)?,
    })
}
