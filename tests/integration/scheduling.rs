//! The engine end to end: config file, SQLite file, HTTP site, webhook

use chrono::Utc;
use lapis_watch::config::load_config;
use lapis_watch::engine::Engine;
use lapis_watch::notify::EVENT_HEADER;
use lapis_watch::output::load_statistics;
use lapis_watch::state::{DeliveryState, RunStatus};
use lapis_watch::storage::{lock_storage, Storage};
use std::io::Write;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::watch;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html")
}

/// Serves `/` linking to `/about` and a robots-disallowed `/private/notes`
async fn mount_site(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private/\n"),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(
            r#"<html><body><a href="/about">About</a> <a href="/private/notes">Notes</a></body></html>"#,
        ))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/about"))
        .respond_with(html("<html><body><p>About us</p></body></html>"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private/notes"))
        .respond_with(html("<p>secret</p>"))
        .expect(0)
        .mount(server)
        .await;
}

fn write_config(server: &MockServer, data_dir: &TempDir) -> NamedTempFile {
    let database = data_dir.path().join("watch.db");
    let content = format!(
        r#"
[notifications]
delivery-interval-secs = 1

[storage]
database-path = "{database}"

[user-agent]
crawler-name = "LapisTest"
crawler-version = "1.0.0"
contact-url = "https://example.com/contact"
contact-email = "test@example.com"

[[website]]
url = "{root}/"
schedule = "hourly"

[website.notifications]
notify-on-completion = true

[[website.notifications.channels]]
channel = "webhook"
target = "{root}/hook"
"#,
        database = database.display(),
        root = server.uri()
    );
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn test_engine_once_crawls_and_notifies() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header(EVENT_HEADER, "run_completed"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let data_dir = TempDir::new().unwrap();
    let config_file = write_config(&server, &data_dir);
    let engine = Engine::new(load_config(config_file.path()).unwrap()).unwrap();

    let sync = engine.sync_websites(Utc::now()).unwrap();
    assert_eq!(sync.synced.len(), 1);
    let website_id = sync.synced[0];

    let report = engine.run_once().await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    let outcome = report.outcomes[0].as_ref().unwrap();
    assert_eq!(outcome.status(), RunStatus::Completed);
    assert_eq!(outcome.run.pages_succeeded, 2);
    assert!(outcome.changes.is_empty());
    assert_eq!(report.delivery.sent, 1);

    {
        let storage = lock_storage(engine.storage()).unwrap();
        let urls: Vec<String> = storage
            .list_pages(website_id)
            .unwrap()
            .into_iter()
            .map(|p| p.url)
            .collect();
        assert_eq!(urls.len(), 2);
        assert!(urls.iter().all(|u| !u.contains("/private/")));

        let tasks = storage.run_notification_tasks(outcome.run.id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].state, DeliveryState::Sent);
    }

    // Not due again until the next hour
    let again = engine.run_once().await.unwrap();
    assert!(again.outcomes.is_empty());
    assert_eq!(again.delivery.attempted, 0);

    let stats = {
        let storage = lock_storage(engine.storage()).unwrap();
        load_statistics(&*storage).unwrap()
    };
    assert_eq!(stats.ledger.websites, 1);
    assert_eq!(stats.websites.len(), 1);
    let last_run = stats.websites[0].last_run.as_ref().unwrap();
    assert_eq!(last_run.id, outcome.run.id);
    assert!(stats.failed_notifications.is_empty());
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let data_dir = TempDir::new().unwrap();
    let config_file = write_config(&server, &data_dir);

    let first_run = {
        let engine = Engine::new(load_config(config_file.path()).unwrap()).unwrap();
        engine.sync_websites(Utc::now()).unwrap();
        let report = engine.run_once().await.unwrap();
        report.outcomes[0].as_ref().unwrap().run.id
    };

    // A restarted engine keeps the schedule instead of crawling again
    let engine = Engine::new(load_config(config_file.path()).unwrap()).unwrap();
    let sync = engine.sync_websites(Utc::now()).unwrap();
    assert!(sync.removed.is_empty());
    let report = engine.run_once().await.unwrap();
    assert!(report.outcomes.is_empty());

    let storage = lock_storage(engine.storage()).unwrap();
    let runs = storage.list_runs(sync.synced[0], 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, first_run);
    assert_eq!(storage.list_pages(sync.synced[0]).unwrap().len(), 2);
}

#[tokio::test]
async fn test_daemon_runs_until_shutdown() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let data_dir = TempDir::new().unwrap();
    let config_file = write_config(&server, &data_dir);
    let engine = Engine::new(load_config(config_file.path()).unwrap()).unwrap();
    engine.sync_websites(Utc::now()).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stop_after_delivery = async {
        let delivered = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                let requests = server.received_requests().await.unwrap_or_default();
                if requests.iter().any(|r| r.url.path() == "/hook") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        shutdown_tx.send(true).unwrap();
        delivered
    };

    let (_, delivered) = tokio::join!(engine.run(shutdown_rx), stop_after_delivery);
    assert!(delivered.is_ok(), "webhook was never delivered");

    let storage = lock_storage(engine.storage()).unwrap();
    assert_eq!(storage.count_active_runs().unwrap(), 0);
}
