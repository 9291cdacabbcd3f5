//! Crawl run coordinator
//!
//! Executes one pending crawl run end to end:
//! - Moves the run to `running` and loads its website
//! - Seeds the frontier with the root URL and fetches robots.txt
//! - Fetches pages with bounded parallelism, retrying transient failures
//! - Fingerprints and classifies every page, persisting the result
//! - Sweeps pages that disappeared from the site
//! - Finalizes the run, releases its lock and hands changes to the dispatcher
//!
//! Fetches run concurrently in a `JoinSet`, but their results are processed
//! one at a time by the coordinating task, so writes for a URL are ordered.

use crate::classifier::ChangeClassifier;
use crate::config::RunConfig;
use crate::crawler::fetcher::{FetchError, FetchResponse, Fetcher};
use crate::crawler::frontier::Frontier;
use crate::crawler::retry::RetryPolicy;
use crate::hasher::ContentHasher;
use crate::notify::NotificationDispatcher;
use crate::robots::{fetch_robots, RobotsRules};
use crate::state::{ChangeKind, PageIssue, PageState, RunStatus};
use crate::storage::{
    lock_storage, BodyStore, ChangeEventRecord, CrawlSettings, NotificationTaskRecord,
    PageObservation, RunFinalization, RunRecord, SharedStorage, SqliteStorage, Storage,
    StorageResult, WebsiteRecord,
};
use crate::url::{normalize_url, UrlScope};
use crate::WatchError;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

/// Final state of an executed run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The run as persisted after finalization
    pub run: RunRecord,
    pub changes: Vec<ChangeEventRecord>,
    /// Notification tasks queued for this run
    pub notifications: Vec<NotificationTaskRecord>,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        self.run.status
    }
}

/// Page counters of a run in progress
#[derive(Debug, Default, Clone, Copy)]
struct RunTally {
    attempted: u32,
    succeeded: u32,
    failed: u32,
    /// Pages that failed without any HTTP response
    network_failures: u32,
    /// Failed pages other than 404/410; their links stay unknown
    unresolved: u32,
}

/// How a crawl loop ended without a systemic failure
enum CrawlEnd {
    Completed,
    /// Cancelled or timed out; the reason is recorded on the run
    Stopped(String),
}

/// Result of one page fetch, handed back to the coordinating task
struct PageFetch {
    url: Url,
    depth: u32,
    result: Result<FetchResponse, FetchError>,
}

/// Executes crawl runs against the shared ledger
pub struct RunCoordinator {
    storage: SharedStorage,
    fetcher: Arc<dyn Fetcher>,
    hasher: Arc<ContentHasher>,
    classifier: ChangeClassifier,
    bodies: Option<Arc<dyn BodyStore>>,
    dispatcher: Option<Arc<NotificationDispatcher>>,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    run_timeout: Duration,
    robots_agent: String,
    /// Cancellation switches of the runs currently executing
    cancellations: Mutex<HashMap<i64, watch::Sender<bool>>>,
}

impl RunCoordinator {
    pub fn new(
        storage: SharedStorage,
        fetcher: Arc<dyn Fetcher>,
        hasher: Arc<ContentHasher>,
        classifier: ChangeClassifier,
        config: &RunConfig,
    ) -> Self {
        Self {
            storage,
            fetcher,
            hasher,
            classifier,
            bodies: None,
            dispatcher: None,
            retry: RetryPolicy::from_config(config),
            fetch_timeout: config.fetch_timeout(),
            run_timeout: config.run_timeout(),
            robots_agent: "lapis-watch".to_string(),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Keeps fetched bodies in `bodies`, keyed by full hash
    pub fn with_body_store(mut self, bodies: Arc<dyn BodyStore>) -> Self {
        self.bodies = Some(bodies);
        self
    }

    /// Informs `dispatcher` of every finished run
    pub fn with_dispatcher(mut self, dispatcher: Arc<NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// User-agent token matched against robots.txt groups
    pub fn with_robots_agent(mut self, agent: impl Into<String>) -> Self {
        self.robots_agent = agent.into();
        self
    }

    /// Requests cancellation of an executing run
    ///
    /// The run stops dispatching, persists its in-flight fetches and ends
    /// `cancelled`.
    ///
    /// # Returns
    ///
    /// `false` if the run is not executing on this coordinator
    pub fn cancel(&self, run_id: i64) -> bool {
        let cancellations = self
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match cancellations.get(&run_id) {
            Some(switch) => switch.send(true).is_ok(),
            None => false,
        }
    }

    /// IDs of the runs currently executing
    pub fn active_runs(&self) -> Vec<i64> {
        let cancellations = self
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<i64> = cancellations.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Executes a pending run to a terminal state
    ///
    /// Per-page problems never fail the run. Systemic failures (fetcher
    /// unusable, website missing, storage write errors) end it `failed`
    /// with the error recorded on the run. A run whose lease was reclaimed
    /// has its writes rejected and stops at the first one.
    ///
    /// # Returns
    ///
    /// * `Ok(RunOutcome)` - The run reached a terminal state
    /// * `Err(WatchError)` - The run could not be started or finalized
    pub async fn execute(&self, run: RunRecord) -> Result<RunOutcome, WatchError> {
        let run_id = run.id;
        let (switch, cancelled) = watch::channel(false);
        let _registration = Registration::new(self, run_id, switch);

        if let Err(e) = self.with_storage(|s| s.mark_run_running(run_id, Utc::now())) {
            error!("Run {} could not start: {}", run_id, e);
            let failure = RunFinalization {
                status: RunStatus::Failed,
                pages_attempted: 0,
                pages_succeeded: 0,
                pages_failed: 0,
                error_message: Some(e.to_string()),
            };
            // Releases the lock if the run is still pending
            self.with_storage(|s| s.finalize_run(run_id, &failure, Utc::now()))?;
            return Err(e);
        }
        info!("Run {} started for website {}", run_id, run.website_id);

        let mut tally = RunTally::default();
        let (status, error_message, website) = match self.load_website(run.website_id) {
            Err(e) => (RunStatus::Failed, Some(e.to_string()), None),
            Ok(website) => {
                let (status, message) =
                    match self.crawl(&website, run_id, &mut tally, cancelled).await {
                        Ok(CrawlEnd::Completed) => (RunStatus::Completed, None),
                        Ok(CrawlEnd::Stopped(reason)) => (RunStatus::Cancelled, Some(reason)),
                        Err(e) => (RunStatus::Failed, Some(e.to_string())),
                    };
                (status, message, Some(website))
            }
        };

        if let (RunStatus::Failed, Some(message)) = (status, &error_message) {
            error!("Run {} failed: {}", run_id, message);
        }

        let finalization = RunFinalization {
            status,
            pages_attempted: tally.attempted,
            pages_succeeded: tally.succeeded,
            pages_failed: tally.failed,
            error_message,
        };
        let applied = self.with_storage(|s| s.finalize_run(run_id, &finalization, Utc::now()))?;
        if !applied {
            warn!(
                "Run {} was already terminal; {} outcome not recorded",
                run_id, status
            );
        }

        let (run, changes) =
            self.with_storage(|s| Ok((s.get_run(run_id)?, s.run_change_events(run_id)?)))?;
        info!(
            "Run {} {}: {} attempted, {} succeeded, {} failed, {} changes",
            run_id,
            run.status,
            run.pages_attempted,
            run.pages_succeeded,
            run.pages_failed,
            changes.len()
        );

        let notifications = match (&self.dispatcher, &website) {
            (Some(dispatcher), Some(website)) => {
                match dispatcher.on_run_finished(website, &run, &changes) {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        error!("Failed to queue notifications for run {}: {}", run_id, e);
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        Ok(RunOutcome {
            run,
            changes,
            notifications,
        })
    }

    fn load_website(&self, website_id: i64) -> Result<WebsiteRecord, WatchError> {
        match self.with_storage(|s| s.get_website(website_id))? {
            Some(website) if website.deleted_at.is_none() => Ok(website),
            _ => Err(WatchError::WebsiteNotFound(website_id)),
        }
    }

    /// The crawl loop; any `Err` fails the run
    async fn crawl(
        &self,
        website: &WebsiteRecord,
        run_id: i64,
        tally: &mut RunTally,
        mut cancelled: watch::Receiver<bool>,
    ) -> Result<CrawlEnd, WatchError> {
        let settings = Arc::new(clamp_settings(&website.crawl));
        let root = normalize_url(&website.root_url)?;
        let scope = UrlScope::new(&settings.include, &settings.exclude)?;
        let mut frontier = Frontier::new(root.clone(), scope, settings.max_depth);

        let baseline = self.with_storage(|s| s.count_pages(website.id))? == 0;
        if baseline {
            info!(
                "Run {} is a baseline for {}; created events are suppressed",
                run_id, website.root_url
            );
        }

        let robots = self.load_robots(&root, &settings).await?;

        let semaphore = Arc::new(Semaphore::new(settings.concurrency as usize));
        let mut in_flight: JoinSet<PageFetch> = JoinSet::new();
        let mut dispatched: u32 = 0;
        let mut stopped: Option<String> = None;

        let deadline = tokio::time::sleep(self.run_timeout);
        tokio::pin!(deadline);

        loop {
            if stopped.is_none() && *cancelled.borrow() {
                stopped = Some("run cancelled".to_string());
            }

            if stopped.is_none() {
                while dispatched < settings.max_pages {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let Some(queued) = frontier.pop() else {
                        break;
                    };
                    if !robots.is_allowed(&queued.url) {
                        debug!("Skipping {} (disallowed by robots.txt)", queued.url);
                        continue;
                    }

                    dispatched += 1;
                    let fetcher = Arc::clone(&self.fetcher);
                    let settings = Arc::clone(&settings);
                    let retry = self.retry;
                    let timeout = self.fetch_timeout;
                    in_flight.spawn(async move {
                        let _permit = permit;
                        let result =
                            fetch_with_retry(fetcher.as_ref(), &queued.url, &settings, retry, timeout)
                                .await;
                        PageFetch {
                            url: queued.url,
                            depth: queued.depth,
                            result,
                        }
                    });
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                changed = cancelled.changed(), if stopped.is_none() => {
                    if changed.is_err() || *cancelled.borrow() {
                        info!("Run {} cancelled; draining {} in-flight fetches", run_id, in_flight.len());
                        stopped = Some("run cancelled".to_string());
                    }
                }
                _ = &mut deadline, if stopped.is_none() => {
                    warn!(
                        "Run {} exceeded its {:?} timeout; draining {} in-flight fetches",
                        run_id, self.run_timeout, in_flight.len()
                    );
                    stopped = Some(format!("run timed out after {}s", self.run_timeout.as_secs()));
                }
                joined = in_flight.join_next() => {
                    match joined {
                        Some(Ok(page)) => {
                            self.process_page(website, run_id, baseline, page, &mut frontier, tally)?;
                        }
                        Some(Err(e)) => {
                            // A panicked fetch task counts as a failed page
                            warn!("Fetch task failed in run {}: {}", run_id, e);
                            tally.attempted += 1;
                            tally.failed += 1;
                        }
                        None => {}
                    }
                }
            }
        }

        if let Some(reason) = stopped {
            return Ok(CrawlEnd::Stopped(reason));
        }

        if tally.attempted > 0 && tally.network_failures == tally.attempted {
            return Err(WatchError::Systemic(format!(
                "fetcher unavailable: all {} pages failed with network errors",
                tally.attempted
            )));
        }

        let truncated = !frontier.is_empty();
        if truncated {
            debug!(
                "Run {} stopped at max-pages={} with {} URLs left",
                run_id,
                settings.max_pages,
                frontier.len()
            );
        }
        if tally.unresolved > 0 {
            debug!(
                "Run {} has {} unresolved pages; only out-of-scope pages are swept",
                run_id, tally.unresolved
            );
        }
        let partial = truncated || tally.unresolved > 0;
        self.sweep(website.id, run_id, &frontier, partial)?;

        Ok(CrawlEnd::Completed)
    }

    async fn load_robots(
        &self,
        root: &Url,
        settings: &CrawlSettings,
    ) -> Result<RobotsRules, WatchError> {
        if !settings.respect_robots {
            return Ok(RobotsRules::allow_all());
        }

        let fetch = fetch_robots(self.fetcher.as_ref(), root, settings, &self.robots_agent);
        match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(Ok(rules)) => Ok(rules),
            Ok(Err(e)) => Err(WatchError::Systemic(e.to_string())),
            Err(_) => {
                warn!("robots.txt for {} timed out, allowing all", root);
                Ok(RobotsRules::allow_all())
            }
        }
    }

    /// Persists the outcome of one fetch
    fn process_page(
        &self,
        website: &WebsiteRecord,
        run_id: i64,
        baseline: bool,
        page: PageFetch,
        frontier: &mut Frontier,
        tally: &mut RunTally,
    ) -> Result<(), WatchError> {
        tally.attempted += 1;

        let response = match page.result {
            Ok(response) => response,
            Err(FetchError::Systemic(e)) => return Err(WatchError::Systemic(e)),
            Err(FetchError::Transient(e)) => {
                warn!("Failed to fetch {}: {}", page.url, e);
                tally.failed += 1;
                tally.network_failures += 1;
                tally.unresolved += 1;
                return Ok(());
            }
        };

        if response.is_gone() {
            tally.failed += 1;
            debug!("{} returned HTTP {}", page.url, response.status_code);
            self.remove_page(website.id, run_id, page.url.as_str(), ChangeKind::Gone)?;
            return Ok(());
        }

        if !response.is_success() {
            warn!("{} returned HTTP {}", page.url, response.status_code);
            tally.failed += 1;
            tally.unresolved += 1;
            return Ok(());
        }

        let fingerprint = self
            .hasher
            .fingerprint(&response.body, response.content_type());
        let previous = self.with_storage(|s| s.get_page(website.id, page.url.as_str()))?;

        let (change, issue) = match self.classifier.classify(previous.as_ref(), &fingerprint) {
            Ok(classification) => {
                let change = classification
                    .into_change()
                    .filter(|c| !(baseline && c.kind == ChangeKind::New));
                let issue = fingerprint.parse_degraded.then_some(PageIssue::ParseDegraded);
                (change, issue)
            }
            Err(e) => {
                warn!("Could not classify {}: {}", page.url, e);
                (None, Some(PageIssue::ClassificationError))
            }
        };

        if fingerprint.parse_degraded {
            debug!("{} hashed as raw bytes", page.url);
        }

        let observation = PageObservation {
            website_id: website.id,
            run_id,
            url: page.url.to_string(),
            full_hash: fingerprint.full_hash.clone(),
            structural_hash: fingerprint.structural_hash.clone(),
            content_length: fingerprint.content_length,
            issue,
            observed_at: Utc::now(),
            change,
        };
        if let Some(event) = self.with_storage(|s| s.record_observation(&observation))? {
            info!(
                "{} {} ({}, severity {:.2})",
                event.change_type, event.url, event.kind, event.severity
            );
        }

        if let Some(bodies) = &self.bodies {
            if let Err(e) = bodies.put(&fingerprint.full_hash, &response.body) {
                warn!("Failed to store body of {}: {}", page.url, e);
            }
        }

        for link in &response.discovered_links {
            frontier.offer(link, page.depth + 1);
        }

        tally.succeeded += 1;
        Ok(())
    }

    /// Tombstones a live page with a removal event
    fn remove_page(
        &self,
        website_id: i64,
        run_id: i64,
        url: &str,
        kind: ChangeKind,
    ) -> Result<(), WatchError> {
        let Some(previous) = self.with_storage(|s| s.get_page(website_id, url))? else {
            return Ok(());
        };

        match self.classifier.removal(&previous, kind) {
            Ok(Some(change)) => {
                let event =
                    self.with_storage(|s| s.tombstone_page(previous.id, run_id, &change, Utc::now()))?;
                if event.is_some() {
                    info!("removed {} ({})", url, kind);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Could not classify removal of {}: {}", url, e),
        }
        Ok(())
    }

    /// Tombstones live pages that this run did not reach
    ///
    /// After a complete crawl every unreached page is gone. A partial crawl
    /// (cut short by max-pages, or with pages that failed other than by
    /// 404/410) only removes pages that fell out of scope.
    fn sweep(
        &self,
        website_id: i64,
        run_id: i64,
        frontier: &Frontier,
        partial: bool,
    ) -> Result<(), WatchError> {
        let pages = self.with_storage(|s| s.list_pages(website_id))?;

        for page in pages {
            if page.state != PageState::Live
                || page.last_seen_run == run_id
                || frontier.was_offered(&page.url)
            {
                continue;
            }

            let in_scope = Url::parse(&page.url)
                .map(|url| frontier.in_scope(&url))
                .unwrap_or(false);
            let kind = match (in_scope, partial) {
                (false, _) => ChangeKind::OutOfScope,
                (true, false) => ChangeKind::Gone,
                (true, true) => continue,
            };
            self.remove_page(website_id, run_id, &page.url, kind)?;
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

/// Keeps a run's cancellation switch registered while it executes
struct Registration<'a> {
    coordinator: &'a RunCoordinator,
    run_id: i64,
}

impl<'a> Registration<'a> {
    fn new(coordinator: &'a RunCoordinator, run_id: i64, switch: watch::Sender<bool>) -> Self {
        coordinator
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id, switch);
        Self {
            coordinator,
            run_id,
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.coordinator
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

/// Max-pages and concurrency are at least 1
fn clamp_settings(settings: &CrawlSettings) -> CrawlSettings {
    CrawlSettings {
        max_pages: settings.max_pages.max(1),
        concurrency: settings.concurrency.max(1),
        ..settings.clone()
    }
}

/// Fetches one URL, retrying timeouts, transient errors, 429 and 5xx
///
/// After the last attempt the final response or error is returned as is.
async fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    url: &Url,
    settings: &CrawlSettings,
    retry: RetryPolicy,
    timeout: Duration,
) -> Result<FetchResponse, FetchError> {
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(timeout, fetcher.fetch(url, settings)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Transient(format!(
                "timed out after {}s",
                timeout.as_secs()
            ))),
        };

        let retryable = match &result {
            Ok(response) => response.is_retryable(),
            Err(FetchError::Transient(_)) => true,
            Err(FetchError::Systemic(_)) => false,
        };
        if !retryable || !retry.should_retry(attempt) {
            return result;
        }

        let delay = retry.delay_after(attempt);
        debug!("Retrying {} in {:?} (attempt {})", url, delay, attempt + 1);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
