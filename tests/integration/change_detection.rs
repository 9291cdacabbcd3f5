//! End-to-end change detection across crawl generations

use crate::support::{minutes, run_config, t0, Harness};
use lapis_watch::config::RunConfig;
use lapis_watch::crawler::{FetchError, RunOutcome};
use lapis_watch::state::{ChangeKind, ChangeType, PageState, RunStatus};
use lapis_watch::storage::{lock_storage, NewWebsite, NotificationSettings, Storage};
use std::time::Duration;

const ROOT: &str = "https://docs.example.com/";

const PAGE_A: &str = r#"<html><head><title>Docs</title></head><body>
<h1>Documentation</h1>
<ul><li><a href="/b">Guide</a></li><li><a href="/c">Reference</a></li></ul>
</body></html>"#;

const PAGE_B: &str = r#"<html><head><title>Guide</title></head><body>
<p>Install the tool and run it once.</p>
</body></html>"#;

const PAGE_B_EDITED: &str = r#"<html><head><title>Guide</title></head><body>
<p>Install the tool, configure it, and run it twice.</p>
</body></html>"#;

const PAGE_C: &str = r#"<html><head><title>Reference</title></head><body>
<p>All options are listed here.</p>
</body></html>"#;

fn site_abc(harness: &Harness) {
    harness.site.page("/", PAGE_A);
    harness.site.page("/b", PAGE_B);
    harness.site.page("/c", PAGE_C);
}

/// Ticks at `at` and waits for the single run it starts
async fn run_at(harness: &Harness, at: chrono::DateTime<chrono::Utc>) -> RunOutcome {
    let report = harness.scheduler.tick_at(at).unwrap();
    assert_eq!(report.started.len(), 1, "expected one run at {}", at);
    let mut outcomes = report.join_all().await;
    outcomes.remove(0).unwrap()
}

fn page_url(path: &str) -> String {
    format!("https://docs.example.com{}", path)
}

#[tokio::test]
async fn test_baseline_run_records_pages_without_events() {
    let harness = Harness::new(run_config());
    let website_id = harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    site_abc(&harness);

    let outcome = run_at(&harness, t0()).await;
    assert_eq!(outcome.status(), RunStatus::Completed);
    assert_eq!(outcome.run.pages_attempted, 3);
    assert_eq!(outcome.run.pages_succeeded, 3);
    assert!(outcome.changes.is_empty());

    let storage = lock_storage(&harness.storage).unwrap();
    let pages = storage.list_pages(website_id).unwrap();
    assert_eq!(pages.len(), 3);
    assert!(pages.iter().all(|p| p.state == PageState::Live));
}

#[tokio::test]
async fn test_second_run_detects_update_and_removal() {
    let harness = Harness::new(run_config());
    let website_id = harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    site_abc(&harness);
    run_at(&harness, t0()).await;

    let page_a_before = lock_storage(&harness.storage)
        .unwrap()
        .get_page(website_id, &page_url("/"))
        .unwrap()
        .unwrap();

    harness.site.page("/b", PAGE_B_EDITED);
    harness.site.status("/c", 404);

    let outcome = run_at(&harness, t0() + minutes(5)).await;
    assert_eq!(outcome.status(), RunStatus::Completed);
    assert_eq!(outcome.run.pages_attempted, 3);
    assert_eq!(outcome.run.pages_succeeded, 2);
    assert_eq!(outcome.run.pages_failed, 1);
    assert_eq!(outcome.changes.len(), 2);

    let updated = outcome
        .changes
        .iter()
        .find(|e| e.change_type == ChangeType::Updated)
        .unwrap();
    assert_eq!(updated.url, page_url("/b"));
    assert_eq!(updated.kind, ChangeKind::Content);
    assert!(updated.severity >= 0.1 && updated.severity <= 0.6);
    assert!(updated.old_hash.is_some());
    assert_ne!(updated.old_hash, updated.new_hash);

    let removed = outcome
        .changes
        .iter()
        .find(|e| e.change_type == ChangeType::Removed)
        .unwrap();
    assert_eq!(removed.url, page_url("/c"));
    assert_eq!(removed.kind, ChangeKind::Gone);

    let storage = lock_storage(&harness.storage).unwrap();
    let page_a_after = storage.get_page(website_id, &page_url("/")).unwrap().unwrap();
    assert_eq!(page_a_after.full_hash, page_a_before.full_hash);
    assert_eq!(page_a_after.structural_hash, page_a_before.structural_hash);
    assert!(storage.page_change_events(page_a_after.id).unwrap().is_empty());

    let page_c = storage.get_page(website_id, &page_url("/c")).unwrap().unwrap();
    assert_eq!(page_c.state, PageState::Tombstoned);
}

#[tokio::test]
async fn test_removed_page_reappears_as_created() {
    let harness = Harness::new(run_config());
    let website_id = harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    site_abc(&harness);
    run_at(&harness, t0()).await;

    harness.site.status("/c", 410);
    let second = run_at(&harness, t0() + minutes(5)).await;
    assert_eq!(second.changes.len(), 1);

    // A third run while still gone adds nothing
    let third = run_at(&harness, t0() + minutes(10)).await;
    assert!(third.changes.is_empty());

    harness.site.page("/c", PAGE_C);
    let fourth = run_at(&harness, t0() + minutes(15)).await;
    assert_eq!(fourth.changes.len(), 1);
    assert_eq!(fourth.changes[0].change_type, ChangeType::Created);
    assert_eq!(fourth.changes[0].kind, ChangeKind::Reappeared);

    let storage = lock_storage(&harness.storage).unwrap();
    let page_c = storage.get_page(website_id, &page_url("/c")).unwrap().unwrap();
    assert_eq!(page_c.state, PageState::Live);
    let history = storage.page_change_events(page_c.id).unwrap();
    let kinds: Vec<ChangeKind> = history.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![ChangeKind::Gone, ChangeKind::Reappeared]);
}

#[tokio::test]
async fn test_new_page_after_baseline_is_created() {
    let harness = Harness::new(run_config());
    harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    harness.site.page("/", r#"<html><body><a href="/b">Guide</a></body></html>"#);
    harness.site.page("/b", PAGE_B);
    run_at(&harness, t0()).await;

    harness.site.page(
        "/",
        r#"<html><body><a href="/b">Guide</a><a href="/c">Reference</a></body></html>"#,
    );
    harness.site.page("/c", PAGE_C);
    let outcome = run_at(&harness, t0() + minutes(5)).await;

    let created: Vec<_> = outcome
        .changes
        .iter()
        .filter(|e| e.change_type == ChangeType::Created)
        .collect();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].url, page_url("/c"));
    assert_eq!(created[0].kind, ChangeKind::New);
    assert!(created[0].old_hash.is_none());
}

#[tokio::test]
async fn test_structural_change_with_identical_text() {
    let harness = Harness::new(run_config());
    let website_id = harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    harness.site.page("/", "<html><body><p>Release notes</p></body></html>");
    run_at(&harness, t0()).await;

    harness.site.page(
        "/",
        "<html><body><div><section><p>Release notes</p></section></div></body></html>",
    );
    let outcome = run_at(&harness, t0() + minutes(5)).await;

    assert_eq!(outcome.changes.len(), 1);
    let event = &outcome.changes[0];
    assert_eq!(event.change_type, ChangeType::Updated);
    assert_eq!(event.kind, ChangeKind::Structural);
    assert!(event.severity >= 0.9);

    let page = lock_storage(&harness.storage)
        .unwrap()
        .get_page(website_id, ROOT)
        .unwrap()
        .unwrap();
    assert_eq!(event.new_hash.as_deref(), Some(page.full_hash.as_str()));
}

#[tokio::test]
async fn test_volatile_content_is_not_a_change() {
    let harness = Harness::new(run_config());
    harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    harness.site.page(
        "/",
        r#"<html><head><meta name="csrf-token" content="abc123"></head>
        <body><!-- build 1 --><p   class="x"  id="main">Hello   world</p></body></html>"#,
    );
    run_at(&harness, t0()).await;

    harness.site.page(
        "/",
        r#"<html><head><meta name="csrf-token" content="zzz999"></head>
        <body><!-- build 2 --><p id="main" class="x">Hello world</p></body></html>"#,
    );
    let outcome = run_at(&harness, t0() + minutes(5)).await;
    assert!(outcome.changes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_cancels_and_keeps_completed_pages() {
    let run = RunConfig {
        run_timeout_secs: 60,
        fetch_timeout_secs: 600,
        ..run_config()
    };
    let harness = Harness::new(run);
    let website_id = harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    harness.site.page("/", r#"<html><body><a href="/b">Guide</a></body></html>"#);
    harness.site.page("/b", PAGE_B);
    run_at(&harness, t0()).await;

    // Root changes and now links to a page that never answers in time
    harness.site.page(
        "/",
        r#"<html><body><a href="/b">Guide</a> <a href="/slow">Slow</a></body></html>"#,
    );
    harness
        .site
        .slow_page("/slow", PAGE_C, Duration::from_secs(3600));

    let outcome = run_at(&harness, t0() + minutes(5)).await;
    assert_eq!(outcome.status(), RunStatus::Cancelled);
    assert_eq!(
        outcome.run.error_message.as_deref(),
        Some("run timed out after 60s")
    );
    assert!(outcome.run.pages_succeeded >= 1);

    // The root update was persisted before the timeout and stands
    assert!(outcome
        .changes
        .iter()
        .any(|e| e.url == ROOT && e.change_type == ChangeType::Updated));

    let storage = lock_storage(&harness.storage).unwrap();
    let schedule = storage.get_schedule(website_id).unwrap().unwrap();
    assert_eq!(schedule.next_due, t0() + minutes(10));
    assert!(storage.get_page(website_id, &page_url("/slow")).unwrap().is_none());
    // A cancelled run does not sweep
    let page_b = storage.get_page(website_id, &page_url("/b")).unwrap().unwrap();
    assert_eq!(page_b.state, PageState::Live);
}

#[tokio::test]
async fn test_missing_root_completes_with_failed_page() {
    let harness = Harness::new(run_config());
    let website_id = harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());

    // Nothing scripted: the root answers 404, an HTTP answer rather than an outage
    let outcome = run_at(&harness, t0()).await;
    assert_eq!(outcome.status(), RunStatus::Completed);
    assert_eq!(outcome.run.pages_attempted, 1);
    assert_eq!(outcome.run.pages_failed, 1);

    let storage = lock_storage(&harness.storage).unwrap();
    assert!(storage.list_pages(website_id).unwrap().is_empty());
    let schedule = storage.get_schedule(website_id).unwrap().unwrap();
    assert_eq!(schedule.next_due, t0() + minutes(5));
}

#[tokio::test]
async fn test_run_for_deleted_website_fails() {
    let harness = Harness::new(run_config());
    let website_id = harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    site_abc(&harness);

    // The spawned run cannot start before this task yields
    let report = harness.scheduler.tick_at(t0()).unwrap();
    lock_storage(&harness.storage)
        .unwrap()
        .soft_delete_website(website_id, t0())
        .unwrap();

    let outcome = report.join_all().await.remove(0).unwrap();
    assert_eq!(outcome.status(), RunStatus::Failed);
    assert_eq!(
        outcome.run.error_message.as_deref(),
        Some(format!("Website {} not found", website_id).as_str())
    );
    assert!(harness.site.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_executing_run() {
    let run = RunConfig {
        fetch_timeout_secs: 600,
        ..run_config()
    };
    let harness = Harness::new(run);
    harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    harness
        .site
        .slow_page("/", r#"<html><body><a href="/b">Guide</a></body></html>"#, Duration::from_secs(120));
    harness.site.page("/b", PAGE_B);

    let report = harness.scheduler.tick_at(t0()).unwrap();
    let run_id = report.started[0].run_id;
    let coordinator = harness.scheduler.coordinator().clone();
    while coordinator.active_runs().is_empty() {
        tokio::task::yield_now().await;
    }
    assert_eq!(coordinator.active_runs(), vec![run_id]);
    assert!(coordinator.cancel(run_id));

    let outcome = report.join_all().await.remove(0).unwrap();
    assert_eq!(outcome.status(), RunStatus::Cancelled);
    assert_eq!(outcome.run.error_message.as_deref(), Some("run cancelled"));
    // The in-flight root fetch was drained and recorded; its link was not followed
    assert_eq!(outcome.run.pages_succeeded, 1);
    assert!(!harness.site.requests().contains(&"/b".to_string()));

    assert!(coordinator.active_runs().is_empty());
    assert!(!coordinator.cancel(run_id));
}

#[tokio::test]
async fn test_failing_root_does_not_remove_unreached_pages() {
    let harness = Harness::new(run_config());
    let website_id = harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    site_abc(&harness);
    run_at(&harness, t0()).await;

    // The root answers 503, so /b and /c are never linked this run
    harness.site.status("/", 503);
    let outcome = run_at(&harness, t0() + minutes(5)).await;
    assert_eq!(outcome.status(), RunStatus::Completed);
    assert_eq!(outcome.run.pages_attempted, 1);
    assert_eq!(outcome.run.pages_failed, 1);
    assert!(outcome.changes.is_empty());

    {
        let storage = lock_storage(&harness.storage).unwrap();
        let pages = storage.list_pages(website_id).unwrap();
        assert_eq!(pages.len(), 3);
        assert!(pages.iter().all(|p| p.state == PageState::Live));
    }

    // Once the root recovers nothing is reported as new or reappeared
    harness.site.page("/", PAGE_A);
    let recovered = run_at(&harness, t0() + minutes(10)).await;
    assert!(recovered.changes.is_empty());
}

#[tokio::test]
async fn test_failing_page_still_sweeps_out_of_scope_pages() {
    let harness = Harness::new(run_config());
    let website_id = harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    site_abc(&harness);
    run_at(&harness, t0()).await;

    // Narrow the scope to exclude /c while /b fails with a server error
    {
        let mut storage = lock_storage(&harness.storage).unwrap();
        let mut website = storage.get_website(website_id).unwrap().unwrap();
        website.crawl.exclude = vec!["/c".to_string()];
        let update = NewWebsite {
            owner_id: website.owner_id,
            root_url: website.root_url.clone(),
            crawl: website.crawl.clone(),
            notifications: website.notifications.clone(),
            active: true,
        };
        storage.upsert_website(&update, "*/5 * * * *", t0()).unwrap();
    }
    harness.site.status("/b", 500);

    let outcome = run_at(&harness, t0() + minutes(5)).await;
    assert_eq!(outcome.changes.len(), 1);
    assert_eq!(outcome.changes[0].url, page_url("/c"));
    assert_eq!(outcome.changes[0].kind, ChangeKind::OutOfScope);

    let storage = lock_storage(&harness.storage).unwrap();
    let page_b = storage.get_page(website_id, &page_url("/b")).unwrap().unwrap();
    assert_eq!(page_b.state, PageState::Live);
}

/// Runs of `website_id` that are pending or running
fn in_flight_runs(harness: &Harness, website_id: i64) -> usize {
    lock_storage(&harness.storage)
        .unwrap()
        .list_runs(website_id, 100)
        .unwrap()
        .iter()
        .filter(|run| !run.status.is_terminal())
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_ticks_during_and_after_a_run_stay_single_flight() {
    let run = RunConfig {
        fetch_timeout_secs: 600,
        ..run_config()
    };
    let harness = Harness::new(run);
    let website_id = harness.add_website(ROOT, "* * * * *", NotificationSettings::default());
    harness.site.slow_page(
        "/",
        r#"<html><body><a href="/b">Guide</a></body></html>"#,
        Duration::from_secs(150),
    );
    harness.site.page("/b", PAGE_B);

    // Tick every 10s while runs start, block on the lock and complete
    let mut started = Vec::new();
    let mut locked_ticks = 0;
    for step in 0..=20 {
        let at = t0() + chrono::Duration::seconds(step * 10);
        let report = harness.scheduler.tick_at(at).unwrap();
        assert!(report.skipped_at_capacity.is_empty());
        locked_ticks += report.skipped_locked.len();
        started.extend(report.started);
        assert!(
            in_flight_runs(&harness, website_id) <= 1,
            "two runs in flight at {}",
            at
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    // One run per free lock: t0, then once the first run released it
    assert_eq!(started.len(), 2);
    assert!(locked_ticks >= 12, "only {} ticks hit the lock", locked_ticks);

    for run in started {
        let outcome = run.handle.await.unwrap().unwrap();
        assert_eq!(outcome.status(), RunStatus::Completed);
    }
    assert_eq!(in_flight_runs(&harness, website_id), 0);
    let storage = lock_storage(&harness.storage).unwrap();
    assert_eq!(storage.list_runs(website_id, 100).unwrap().len(), 2);
    assert_eq!(storage.count_active_runs().unwrap(), 0);
}

#[tokio::test]
async fn test_systemic_fetch_failure_fails_run_and_frees_schedule() {
    let harness = Harness::new(run_config());
    let website_id = harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    site_abc(&harness);
    run_at(&harness, t0()).await;

    harness
        .site
        .fail("/", FetchError::Systemic("proxy refused all connections".to_string()));
    let outcome = run_at(&harness, t0() + minutes(5)).await;
    assert_eq!(outcome.status(), RunStatus::Failed);
    assert_eq!(
        outcome.run.error_message.as_deref(),
        Some("Systemic failure: proxy refused all connections")
    );
    assert!(outcome.changes.is_empty());

    {
        let storage = lock_storage(&harness.storage).unwrap();
        let schedule = storage.get_schedule(website_id).unwrap().unwrap();
        assert_eq!(schedule.next_due, t0() + minutes(10));
        assert_eq!(schedule.last_run, Some(t0() + minutes(5)));
        assert!(schedule.active);
        assert_eq!(storage.count_active_runs().unwrap(), 0);
        for page in storage.list_pages(website_id).unwrap() {
            assert_eq!(page.state, PageState::Live, "{} was swept", page.url);
        }
    }

    // The lock was released, so the next occurrence runs normally
    site_abc(&harness);
    let outcome = run_at(&harness, t0() + minutes(10)).await;
    assert_eq!(outcome.status(), RunStatus::Completed);
    assert!(outcome.changes.is_empty());
}

#[tokio::test]
async fn test_network_failure_on_every_page_fails_run() {
    let harness = Harness::new(run_config());
    let website_id = harness.add_website(ROOT, "*/5 * * * *", NotificationSettings::default());
    site_abc(&harness);
    run_at(&harness, t0()).await;

    harness
        .site
        .fail("/", FetchError::Transient("connection reset".to_string()));
    let outcome = run_at(&harness, t0() + minutes(5)).await;
    assert_eq!(outcome.status(), RunStatus::Failed);
    assert_eq!(outcome.run.pages_attempted, 1);
    assert_eq!(outcome.run.pages_failed, 1);
    assert_eq!(
        outcome.run.error_message.as_deref(),
        Some("Systemic failure: fetcher unavailable: all 1 pages failed with network errors")
    );
    assert!(outcome.changes.is_empty());

    {
        let storage = lock_storage(&harness.storage).unwrap();
        let schedule = storage.get_schedule(website_id).unwrap().unwrap();
        assert_eq!(schedule.next_due, t0() + minutes(10));
        assert_eq!(storage.count_active_runs().unwrap(), 0);
        for page in storage.list_pages(website_id).unwrap() {
            assert_eq!(page.state, PageState::Live, "{} was swept", page.url);
        }
    }

    site_abc(&harness);
    let outcome = run_at(&harness, t0() + minutes(10)).await;
    assert_eq!(outcome.status(), RunStatus::Completed);
}
