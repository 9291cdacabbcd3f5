//! Engine wiring
//!
//! Builds the scheduler, run coordinator and notification dispatcher from a
//! [`Config`], keeps the ledger's website list in sync with the config and
//! prunes artifacts past their retention.

use crate::classifier::ChangeClassifier;
use crate::config::{Config, WebsiteEntry};
use crate::crawler::{Fetcher, HttpFetcher, RunCoordinator, RunOutcome};
use crate::hasher::ContentHasher;
use crate::notify::{
    DeliveryReport, InAppSink, LogSink, NotificationDispatcher, WebhookSink,
};
use crate::scheduler::{CronExpr, RunHandle, Scheduler};
use crate::state::Channel;
use crate::storage::{
    lock_storage, open_storage, BodyStore, CrawlSettings, FsBodyStore, NewWebsite, PruneReport,
    SharedStorage, Storage,
};
use crate::url::normalize_url;
use crate::{ConfigError, WatchError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How often the daemon runs the retention pass
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Result of reconciling configured websites with the ledger
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// IDs of the configured websites
    pub synced: Vec<i64>,
    /// Websites soft-deleted because they left the config
    pub removed: Vec<i64>,
}

/// Result of a single scheduling pass
#[derive(Debug)]
pub struct OnceReport {
    pub outcomes: Vec<Result<RunOutcome, WatchError>>,
    pub delivery: DeliveryReport,
    /// `None` when retention is disabled
    pub pruned: Option<PruneReport>,
}

pub struct Engine {
    config: Config,
    storage: SharedStorage,
    scheduler: Scheduler,
    dispatcher: Arc<NotificationDispatcher>,
    bodies: Option<Arc<dyn BodyStore>>,
}

impl Engine {
    /// Opens the configured database and fetches over HTTP
    pub fn new(config: Config) -> Result<Self, WatchError> {
        let storage = open_storage(Path::new(&config.storage.database_path))?;
        let fetcher = HttpFetcher::new(&config.user_agent, config.run.fetch_timeout())?;
        Self::with_parts(config, storage, Arc::new(fetcher))
    }

    /// Builds the engine around an existing ledger and fetcher
    pub fn with_parts(
        config: Config,
        storage: SharedStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, WatchError> {
        let webhook = WebhookSink::new(
            Duration::from_secs(config.notifications.webhook_timeout_secs),
            config.notifications.webhook_secret.clone(),
        )?;
        let dispatcher = Arc::new(
            NotificationDispatcher::new(storage.clone(), config.notifications.clone())
                .with_sink(Channel::Webhook, Arc::new(webhook))
                .with_sink(Channel::InApp, Arc::new(InAppSink::new(storage.clone())))
                .with_sink(Channel::Email, Arc::new(LogSink)),
        );

        let hasher = Arc::new(ContentHasher::new(&config.hasher)?);
        let classifier = ChangeClassifier::new(config.classifier.clone());
        let mut coordinator =
            RunCoordinator::new(storage.clone(), fetcher, hasher, classifier, &config.run)
                .with_dispatcher(dispatcher.clone())
                .with_robots_agent(config.user_agent.crawler_name.clone());
        let bodies: Option<Arc<dyn BodyStore>> = match &config.storage.body_store_path {
            Some(path) => Some(Arc::new(FsBodyStore::new(path)?)),
            None => None,
        };
        if let Some(bodies) = &bodies {
            coordinator = coordinator.with_body_store(bodies.clone());
        }

        let scheduler = Scheduler::new(
            storage.clone(),
            Arc::new(coordinator),
            config.scheduler.clone(),
        );

        Ok(Self {
            config,
            storage,
            scheduler,
            dispatcher,
            bodies,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    /// Registers or updates every configured website
    ///
    /// A website new to the ledger is due at `now`. A changed schedule of a
    /// known website is due at its next occurrence after `now`. Websites in
    /// the ledger but absent from the config are soft-deleted; their history
    /// is kept.
    pub fn sync_websites(&self, now: DateTime<Utc>) -> Result<SyncReport, WatchError> {
        let mut planned = Vec::with_capacity(self.config.websites.len());
        for entry in &self.config.websites {
            planned.push(plan_website(entry, now)?);
        }

        let mut report = SyncReport::default();
        let mut storage = lock_storage(&self.storage)?;
        let known: HashSet<String> = storage
            .list_websites()?
            .into_iter()
            .map(|w| w.root_url)
            .collect();

        for (website, expression, next_due) in &planned {
            let next_due = if known.contains(&website.root_url) {
                *next_due
            } else {
                now
            };
            let id = storage.upsert_website(website, expression, next_due)?;
            info!(
                "Website {} ({}) scheduled '{}'",
                id, website.root_url, expression
            );
            report.synced.push(id);
        }

        let configured: HashSet<i64> = report.synced.iter().copied().collect();
        for website in storage.list_websites()? {
            if !configured.contains(&website.id) {
                warn!(
                    "Website {} ({}) is no longer configured; removing",
                    website.id, website.root_url
                );
                storage.soft_delete_website(website.id, now)?;
                report.removed.push(website.id);
            }
        }

        Ok(report)
    }

    /// Starts a run of the configured website with root `url` right away
    ///
    /// # Returns
    ///
    /// `None` when a run of that website is already in progress
    pub fn trigger(&self, url: &str) -> Result<Option<RunHandle>, WatchError> {
        let root = normalize_url(url)?.to_string();
        let website = lock_storage(&self.storage)?
            .list_websites()?
            .into_iter()
            .find(|w| w.root_url == root)
            .ok_or_else(|| ConfigError::Validation(format!("{} is not a monitored website", root)))?;
        self.scheduler.trigger_now(website.id)
    }

    /// Deletes artifacts older than the configured retention
    ///
    /// Stale bodies are removed from the body store one by one; a failed
    /// removal is logged and the pass carries on.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<Option<PruneReport>, WatchError> {
        let Some(retention) = self.config.storage.retention() else {
            return Ok(None);
        };
        let report = lock_storage(&self.storage)?.prune_before(now - retention)?;

        let mut bodies_removed = 0;
        if let Some(bodies) = &self.bodies {
            for hash in &report.stale_body_hashes {
                match bodies.remove(hash) {
                    Ok(true) => bodies_removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to remove body {}: {}", hash, e),
                }
            }
        }

        info!(
            "Pruned {} sent notifications, {} in-app notifications and {} bodies",
            report.notification_tasks, report.in_app_notifications, bodies_removed
        );
        Ok(Some(report))
    }

    /// Ticks once, waits for the started runs, delivers due notifications
    /// and prunes expired artifacts
    pub async fn run_once(&self) -> Result<OnceReport, WatchError> {
        let tick = self.scheduler.tick()?;
        info!(
            "Tick started {} runs ({} locked, {} at capacity)",
            tick.started.len(),
            tick.skipped_locked.len(),
            tick.skipped_at_capacity.len()
        );
        let outcomes = tick.join_all().await;
        let delivery = self.dispatcher.deliver_due(Utc::now()).await?;
        let pruned = self.prune(Utc::now())?;
        Ok(OnceReport {
            outcomes,
            delivery,
            pruned,
        })
    }

    /// Runs the scheduler, delivery and retention loops until `shutdown`
    /// turns true
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tokio::join!(
            self.scheduler
                .run(self.config.scheduler.tick_interval(), shutdown.clone()),
            self.dispatcher
                .run(self.config.notifications.delivery_interval(), shutdown.clone()),
            self.prune_loop(PRUNE_INTERVAL, shutdown),
        );
    }

    async fn prune_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        if self.config.storage.retention().is_none() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.prune(Utc::now()) {
                        error!("Retention pass failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Normalized website definition, schedule expression and first due time
pub fn plan_website(
    entry: &WebsiteEntry,
    now: DateTime<Utc>,
) -> Result<(NewWebsite, String, DateTime<Utc>), WatchError> {
    let root = normalize_url(&entry.url)?;
    let cron = CronExpr::from_schedule(&entry.schedule)?;
    let next_due = cron.next_after(now).ok_or_else(|| {
        ConfigError::InvalidSchedule(format!("'{}' has no future occurrence", entry.schedule))
    })?;

    let website = NewWebsite {
        owner_id: entry.owner_id,
        root_url: root.to_string(),
        crawl: CrawlSettings {
            max_pages: entry.max_pages,
            max_depth: entry.max_depth,
            include: entry.include.clone(),
            exclude: entry.exclude.clone(),
            concurrency: entry.concurrency,
            respect_robots: entry.respect_robots,
        },
        notifications: entry.notifications.clone(),
        active: entry.active,
    };

    Ok((website, entry.schedule.trim().to_string(), next_due))
}
