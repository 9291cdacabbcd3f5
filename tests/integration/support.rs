//! Shared fixtures: a scripted in-process website and engine wiring

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lapis_watch::classifier::ChangeClassifier;
use lapis_watch::config::{ClassifierConfig, HasherConfig, RunConfig, SchedulerConfig};
use lapis_watch::crawler::{extract_links, FetchError, FetchResponse, Fetcher, RunCoordinator};
use lapis_watch::hasher::ContentHasher;
use lapis_watch::notify::NotificationDispatcher;
use lapis_watch::scheduler::Scheduler;
use lapis_watch::storage::{
    lock_storage, CrawlSettings, NewWebsite, NotificationSettings, SharedStorage, SqliteStorage,
    Storage,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
struct ScriptedPage {
    status: u16,
    body: String,
    delay: Option<Duration>,
    /// Returned instead of a response
    error: Option<FetchError>,
}

/// A website whose pages are set by the test
///
/// Unknown paths answer 404. Requests are recorded by path.
#[derive(Default)]
pub struct ScriptedSite {
    pages: Mutex<HashMap<String, ScriptedPage>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedSite {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn page(&self, path: &str, body: &str) {
        self.set(path, 200, body, None);
    }

    pub fn status(&self, path: &str, status: u16) {
        self.set(path, status, "", None);
    }

    pub fn slow_page(&self, path: &str, body: &str, delay: Duration) {
        self.set(path, 200, body, Some(delay));
    }

    /// Makes every fetch of `path` fail without a response
    pub fn fail(&self, path: &str, error: FetchError) {
        self.pages.lock().unwrap().insert(
            path.to_string(),
            ScriptedPage {
                status: 0,
                body: String::new(),
                delay: None,
                error: Some(error),
            },
        );
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn set(&self, path: &str, status: u16, body: &str, delay: Option<Duration>) {
        self.pages.lock().unwrap().insert(
            path.to_string(),
            ScriptedPage {
                status,
                body: body.to_string(),
                delay,
                error: None,
            },
        );
    }
}

#[async_trait]
impl Fetcher for ScriptedSite {
    async fn fetch(
        &self,
        url: &Url,
        _settings: &CrawlSettings,
    ) -> Result<FetchResponse, FetchError> {
        self.requests.lock().unwrap().push(url.path().to_string());
        let page = self.pages.lock().unwrap().get(url.path()).cloned();
        let page = page.unwrap_or(ScriptedPage {
            status: 404,
            body: String::new(),
            delay: None,
            error: None,
        });

        if let Some(delay) = page.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = page.error {
            return Err(error);
        }

        let discovered_links = if page.status == 200 {
            extract_links(&page.body, url)
        } else {
            Vec::new()
        };
        Ok(FetchResponse {
            status_code: page.status,
            headers: HashMap::from([(
                "content-type".to_string(),
                "text/html; charset=utf-8".to_string(),
            )]),
            body: page.body.into_bytes(),
            final_url: url.clone(),
            discovered_links,
        })
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

pub fn memory_storage() -> SharedStorage {
    Arc::new(Mutex::new(SqliteStorage::new_in_memory().unwrap()))
}

/// Run limits suited to in-process sites: one attempt per page
pub fn run_config() -> RunConfig {
    RunConfig {
        max_fetch_attempts: 1,
        ..RunConfig::default()
    }
}

pub struct Harness {
    pub storage: SharedStorage,
    pub site: Arc<ScriptedSite>,
    pub scheduler: Scheduler,
}

impl Harness {
    pub fn new(run: RunConfig) -> Self {
        Self::build(run, memory_storage(), None)
    }

    /// Runs notify `dispatcher`, which must share `storage`
    pub fn with_dispatcher(
        run: RunConfig,
        storage: SharedStorage,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self::build(run, storage, Some(dispatcher))
    }

    fn build(
        run: RunConfig,
        storage: SharedStorage,
        dispatcher: Option<Arc<NotificationDispatcher>>,
    ) -> Self {
        let site = ScriptedSite::new();
        let mut coordinator = RunCoordinator::new(
            storage.clone(),
            site.clone(),
            Arc::new(ContentHasher::new(&HasherConfig::default()).unwrap()),
            ChangeClassifier::new(ClassifierConfig::default()),
            &run,
        );
        if let Some(dispatcher) = dispatcher {
            coordinator = coordinator.with_dispatcher(dispatcher);
        }
        let scheduler = Scheduler::new(
            storage.clone(),
            Arc::new(coordinator),
            SchedulerConfig::default(),
        );
        Self {
            storage,
            site,
            scheduler,
        }
    }

    /// Registers a website due at `t0()`
    pub fn add_website(
        &self,
        root_url: &str,
        expression: &str,
        notifications: NotificationSettings,
    ) -> i64 {
        let website = NewWebsite {
            owner_id: 1,
            root_url: root_url.to_string(),
            crawl: CrawlSettings {
                respect_robots: false,
                ..CrawlSettings::default()
            },
            notifications,
            active: true,
        };
        lock_storage(&self.storage)
            .unwrap()
            .upsert_website(&website, expression, t0())
            .unwrap()
    }
}
