//! Notification dispatcher
//!
//! Turns finished runs into notification tasks and delivers due tasks through
//! the sink registered for their channel. Tasks live in the ledger, so a
//! delivery that fails is retried on a later pass with exponential backoff
//! until it succeeds or runs out of attempts.

use super::digest::DigestPayload;
use super::sink::{DeliveryError, NotificationSink};
use crate::config::NotificationsConfig;
use crate::state::{Channel, RunStatus, TaskKind};
use crate::storage::{
    lock_storage, ChangeEventRecord, NewNotificationTask, NotificationTaskRecord, RunRecord,
    SharedStorage, SqliteStorage, Storage, StorageError, StorageResult, WebsiteRecord,
};
use crate::WatchError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Most tasks loaded by one delivery pass
const DELIVERY_BATCH: u32 = 100;

/// What one delivery pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub sent: usize,
    /// Tasks rescheduled with backoff
    pub retried: usize,
    pub failed_permanent: usize,
}

pub struct NotificationDispatcher {
    storage: SharedStorage,
    config: NotificationsConfig,
    sinks: HashMap<Channel, Arc<dyn NotificationSink>>,
}

impl NotificationDispatcher {
    pub fn new(storage: SharedStorage, config: NotificationsConfig) -> Self {
        Self {
            storage,
            config,
            sinks: HashMap::new(),
        }
    }

    /// Registers the sink used for `channel`, replacing any previous one
    pub fn with_sink(mut self, channel: Channel, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.insert(channel, sink);
        self
    }

    /// Queues the notifications for a finished run
    ///
    /// All changes at or above the website's `min-severity` are coalesced into
    /// one digest per subscription. Without such changes, a task is queued
    /// only for a failed run (`notify-on-failure`) or a completed run
    /// (`notify-on-completion`).
    ///
    /// # Returns
    ///
    /// The newly queued tasks. Tasks already queued for this run, channel and
    /// target are not duplicated.
    pub fn on_run_finished(
        &self,
        website: &WebsiteRecord,
        run: &RunRecord,
        events: &[ChangeEventRecord],
    ) -> Result<Vec<NotificationTaskRecord>, WatchError> {
        let settings = &website.notifications;
        if settings.channels.is_empty() {
            return Ok(Vec::new());
        }

        let matching: Vec<&ChangeEventRecord> = events
            .iter()
            .filter(|event| event.severity >= settings.min_severity)
            .collect();

        let kind = if !matching.is_empty() {
            TaskKind::ChangeDigest
        } else {
            match run.status {
                RunStatus::Failed if settings.notify_on_failure => TaskKind::RunFailed,
                RunStatus::Completed if settings.notify_on_completion => TaskKind::RunCompleted,
                _ => {
                    debug!("Run {} has nothing to notify", run.id);
                    return Ok(Vec::new());
                }
            }
        };

        let now = Utc::now();
        let payload = DigestPayload::build(kind, website, run, &matching, now)
            .to_json()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let queued = self.with_storage(|s| {
            let mut queued = Vec::new();
            for subscription in &settings.channels {
                let task = NewNotificationTask {
                    website_id: website.id,
                    run_id: run.id,
                    channel: subscription.channel,
                    target: subscription.target.clone(),
                    kind,
                    payload: payload.clone(),
                };
                if let Some(record) = s.insert_notification_task(&task, now)? {
                    queued.push(record);
                }
            }
            Ok(queued)
        })?;

        if !queued.is_empty() {
            info!(
                "Queued {} {} notifications for run {} ({} changes)",
                queued.len(),
                kind,
                run.id,
                matching.len()
            );
        }
        Ok(queued)
    }

    /// Attempts delivery of every task due at `now`
    pub async fn deliver_due(&self, now: DateTime<Utc>) -> Result<DeliveryReport, WatchError> {
        let tasks = self.with_storage(|s| s.due_notification_tasks(now, DELIVERY_BATCH))?;
        let mut report = DeliveryReport {
            attempted: tasks.len(),
            ..DeliveryReport::default()
        };
        if tasks.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(
            self.config.max_concurrent_deliveries.max(1) as usize,
        ));
        let mut deliveries = JoinSet::new();

        for task in tasks {
            let sink = self.sinks.get(&task.channel).cloned();
            let semaphore = semaphore.clone();
            deliveries.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = deliver(sink, &task).await;
                (task, result)
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((task, result)) => self.record_delivery(&task, result, now, &mut report)?,
                // The task stays due and is picked up by the next pass
                Err(e) => error!("Delivery task panicked: {}", e),
            }
        }

        info!(
            "Delivered {} of {} notifications ({} retrying, {} failed)",
            report.sent, report.attempted, report.retried, report.failed_permanent
        );
        Ok(report)
    }

    /// Delivers due tasks every `interval` until `shutdown` flips to true
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Notification dispatcher started (every {:?})", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.deliver_due(Utc::now()).await {
                        error!("Notification delivery pass failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Notification dispatcher stopped");
    }

    /// Delay before retrying a task that has failed `attempt` times
    pub fn backoff(&self, attempt: u32) -> chrono::Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let secs = self
            .config
            .backoff_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.config.backoff_max_secs);
        chrono::Duration::seconds(secs as i64)
    }

    fn record_delivery(
        &self,
        task: &NotificationTaskRecord,
        result: Result<(), DeliveryError>,
        now: DateTime<Utc>,
        report: &mut DeliveryReport,
    ) -> Result<(), WatchError> {
        let attempt = task.attempt_count + 1;
        match result {
            Ok(()) => {
                self.with_storage(|s| s.mark_task_sent(task.id, now))?;
                debug!(
                    "Notification {} sent via {} to {}",
                    task.id, task.channel, task.target
                );
                report.sent += 1;
            }
            Err(DeliveryError::Retryable(message)) if attempt < self.config.max_attempts => {
                let next_attempt_at = now + self.backoff(attempt);
                self.with_storage(|s| s.mark_task_retryable(task.id, &message, next_attempt_at))?;
                warn!(
                    "Notification {} attempt {} failed, retrying at {}: {}",
                    task.id, attempt, next_attempt_at, message
                );
                report.retried += 1;
            }
            Err(DeliveryError::Retryable(message)) | Err(DeliveryError::Permanent(message)) => {
                self.with_storage(|s| s.mark_task_failed(task.id, &message))?;
                error!(
                    "ALERT: notification {} for run {} via {} to {} failed permanently after {} attempts: {}",
                    task.id, task.run_id, task.channel, task.target, attempt, message
                );
                report.failed_permanent += 1;
            }
        }
        Ok(())
    }

    fn with_storage<T>(
        &self,
        f: impl FnOnce(&mut SqliteStorage) -> StorageResult<T>,
    ) -> Result<T, WatchError> {
        let mut storage = lock_storage(&self.storage)?;
        Ok(f(&mut storage)?)
    }
}

async fn deliver(
    sink: Option<Arc<dyn NotificationSink>>,
    task: &NotificationTaskRecord,
) -> Result<(), DeliveryError> {
    let Some(sink) = sink else {
        return Err(DeliveryError::Permanent(format!(
            "no sink registered for channel {}",
            task.channel
        )));
    };
    let payload = DigestPayload::from_json(&task.payload)
        .map_err(|e| DeliveryError::Permanent(format!("unreadable payload: {}", e)))?;
    sink.send(&task.target, &payload).await
}
