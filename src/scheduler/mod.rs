//! Crawl scheduling
//!
//! Each tick the scheduler:
//! 1. Fails runs whose lock lease expired and releases their locks
//! 2. Finds schedules whose `next_due` has passed
//! 3. For each, atomically takes the website's run lock, creates a pending
//!    run and advances `next_due` to the next future occurrence
//! 4. Spawns the run on the [`RunCoordinator`]
//!
//! A tick only enqueues work; runs execute as independent tokio tasks.

mod cron;

pub use cron::{CronError, CronExpr};

use crate::config::SchedulerConfig;
use crate::crawler::{RunCoordinator, RunOutcome};
use crate::storage::{lock_storage, RunRecord, SharedStorage, Storage};
use crate::WatchError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A run spawned by a tick
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: i64,
    pub website_id: i64,
    pub handle: JoinHandle<Result<RunOutcome, WatchError>>,
}

/// What one tick did
#[derive(Debug, Default)]
pub struct TickReport {
    /// Runs failed because their lease expired
    pub reclaimed: Vec<i64>,
    pub started: Vec<RunHandle>,
    /// Due websites skipped because the global run cap was reached
    pub skipped_at_capacity: Vec<i64>,
    /// Due websites skipped because a run already holds their lock
    pub skipped_locked: Vec<i64>,
    /// Websites whose schedule was deactivated (invalid or exhausted expression)
    pub deactivated: Vec<i64>,
}

impl TickReport {
    /// Waits for every run started by this tick
    pub async fn join_all(self) -> Vec<Result<RunOutcome, WatchError>> {
        let mut outcomes = Vec::with_capacity(self.started.len());
        for run in self.started {
            let outcome = match run.handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(WatchError::Systemic(format!(
                    "run {} task failed: {}",
                    run.run_id, e
                ))),
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

pub struct Scheduler {
    storage: SharedStorage,
    coordinator: Arc<RunCoordinator>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        storage: SharedStorage,
        coordinator: Arc<RunCoordinator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            storage,
            coordinator,
            config,
        }
    }

    pub fn coordinator(&self) -> &Arc<RunCoordinator> {
        &self.coordinator
    }

    /// Runs one tick at the current time
    pub fn tick(&self) -> Result<TickReport, WatchError> {
        self.tick_at(Utc::now())
    }

    /// Runs one tick as of `now`
    ///
    /// Must be called from within a tokio runtime. Storage errors abort the
    /// tick; runs already spawned keep executing.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, WatchError> {
        let mut report = TickReport::default();
        let mut storage = lock_storage(&self.storage)?;

        report.reclaimed = storage.reclaim_expired_locks(now)?;
        for run_id in &report.reclaimed {
            warn!("Run {} lease expired; marked failed", run_id);
        }

        let due = storage.due_schedules(now)?;
        if due.is_empty() {
            return Ok(report);
        }

        let mut active = storage.count_active_runs()?;
        let mut pending = Vec::new();
        let lease = self.lease();

        for schedule in due {
            let website_id = schedule.website_id;

            let cron = match CronExpr::from_schedule(&schedule.expression) {
                Ok(cron) => cron,
                Err(e) => {
                    error!(
                        "Invalid schedule '{}' for website {}: {}; deactivating",
                        schedule.expression, website_id, e
                    );
                    storage.set_schedule_active(website_id, false)?;
                    report.deactivated.push(website_id);
                    continue;
                }
            };

            if active >= self.config.max_concurrent_runs {
                debug!(
                    "Website {} is due but {} runs are active; skipping",
                    website_id, active
                );
                report.skipped_at_capacity.push(website_id);
                continue;
            }

            let next_due = cron.next_after(now);
            let Some(run) = storage.begin_run(website_id, now, next_due, now + lease)? else {
                debug!("Website {} already has a run in progress", website_id);
                report.skipped_locked.push(website_id);
                continue;
            };

            match next_due {
                Some(next) => debug!("Website {} next due at {}", website_id, next),
                None => {
                    warn!(
                        "Schedule '{}' of website {} has no future occurrence; deactivated",
                        schedule.expression, website_id
                    );
                    report.deactivated.push(website_id);
                }
            }

            active += 1;
            pending.push(run);
        }

        // Coordinators lock the storage as soon as they start
        drop(storage);

        for run in pending {
            report.started.push(self.spawn(run));
        }

        Ok(report)
    }

    /// Starts a run of one website right away, outside its schedule
    pub fn trigger_now(&self, website_id: i64) -> Result<Option<RunHandle>, WatchError> {
        self.trigger_at(website_id, Utc::now())
    }

    /// Starts a run of one website as of `now`
    ///
    /// Takes the same run lock as a scheduled run and leaves `next_due`
    /// untouched. The global run cap does not apply.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(handle))` - The run was created and spawned
    /// * `Ok(None)` - Another run holds the website's lock
    /// * `Err(WatchError::WebsiteNotFound)` - Unknown or deleted website
    pub fn trigger_at(
        &self,
        website_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<RunHandle>, WatchError> {
        let run = {
            let mut storage = lock_storage(&self.storage)?;
            match storage.get_website(website_id)? {
                Some(website) if website.deleted_at.is_none() => {}
                _ => return Err(WatchError::WebsiteNotFound(website_id)),
            }

            let next_due = storage.get_schedule(website_id)?.map(|s| s.next_due);
            match storage.begin_run(website_id, now, next_due, now + self.lease())? {
                Some(run) => run,
                None => {
                    debug!("Website {} already has a run in progress", website_id);
                    return Ok(None);
                }
            }
        };

        info!("Run {} triggered for website {}", run.id, website_id);
        Ok(Some(self.spawn(run)))
    }

    fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.lock_lease())
            .unwrap_or_else(|_| chrono::Duration::hours(2))
    }

    fn spawn(&self, run: RunRecord) -> RunHandle {
        info!("Starting run {} for website {}", run.id, run.website_id);
        let coordinator = Arc::clone(&self.coordinator);
        let (run_id, website_id) = (run.id, run.website_id);
        let handle = tokio::spawn(async move { coordinator.execute(run).await });
        RunHandle {
            run_id,
            website_id,
            handle,
        }
    }

    /// Ticks every `interval` until `shutdown` turns true
    ///
    /// On shutdown, runs still executing are cancelled and awaited so they
    /// end `cancelled` with their locks released.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut running: Vec<RunHandle> = Vec::new();

        info!("Scheduler started (tick every {:?})", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    running.retain(|run| !run.handle.is_finished());
                    match self.tick() {
                        Ok(report) => {
                            if !report.started.is_empty() {
                                debug!("Tick started {} runs", report.started.len());
                            }
                            running.extend(report.started);
                        }
                        Err(e) => error!("Scheduler tick failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        running.retain(|run| !run.handle.is_finished());
        if !running.is_empty() {
            info!("Cancelling {} in-flight runs", running.len());
        }
        for run in &running {
            self.coordinator.cancel(run.run_id);
        }
        for run in running {
            if let Err(e) = run.handle.await {
                error!("Run {} task failed: {}", run.run_id, e);
            }
        }

        info!("Scheduler stopped");
    }
}
