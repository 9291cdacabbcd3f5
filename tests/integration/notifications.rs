//! Notification delivery against real HTTP endpoints

use crate::support::{memory_storage, minutes, run_config, t0, Harness};
use chrono::Utc;
use lapis_watch::config::NotificationsConfig;
use lapis_watch::notify::{
    sign_body, DeliveryError, DigestPayload, NotificationDispatcher, NotificationSink,
    WebhookSink, EVENT_HEADER, SIGNATURE_HEADER,
};
use lapis_watch::state::{Channel, DeliveryState, RunStatus, TaskKind};
use lapis_watch::storage::{lock_storage, ChannelSubscription, NotificationSettings, Storage};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sample_payload() -> DigestPayload {
    DigestPayload {
        kind: TaskKind::RunFailed,
        website_id: 3,
        root_url: "https://docs.example.com/".to_string(),
        run_id: 41,
        run_status: RunStatus::Failed,
        pages_attempted: 0,
        pages_succeeded: 0,
        pages_failed: 0,
        error_message: Some("Website 3 not found".to_string()),
        subject: "Crawl of https://docs.example.com/ failed".to_string(),
        message: "Run 41 failed".to_string(),
        changes: Vec::new(),
        generated_at: t0(),
    }
}

fn webhook(secret: Option<&str>) -> WebhookSink {
    WebhookSink::new(Duration::from_secs(5), secret.map(str::to_string)).unwrap()
}

#[tokio::test]
async fn test_webhook_is_signed_and_tagged() {
    let server = MockServer::start().await;
    let payload = sample_payload();
    let body = serde_json::to_vec(&payload).unwrap();
    let signature = sign_body("s3cret", &body).unwrap();

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header(SIGNATURE_HEADER, signature.as_str()))
        .and(header(EVENT_HEADER, "run_failed"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let target = format!("{}/hook", server.uri());
    webhook(Some("s3cret"))
        .send(&target, &payload)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let received = DigestPayload::from_json(std::str::from_utf8(&requests[0].body).unwrap()).unwrap();
    assert_eq!(received.run_id, 41);
    assert_eq!(received.error_message.as_deref(), Some("Website 3 not found"));
}

#[tokio::test]
async fn test_webhook_status_mapping() {
    let server = MockServer::start().await;
    for (route, status) in [("/busy", 503), ("/slow-down", 429), ("/gone", 410), ("/bad", 400)] {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
    }

    let sink = webhook(None);
    let payload = sample_payload();
    let send = |route: &str| format!("{}{}", server.uri(), route);

    for route in ["/busy", "/slow-down"] {
        let result = sink.send(&send(route), &payload).await;
        assert!(
            matches!(result, Err(DeliveryError::Retryable(_))),
            "{} should be retryable, got {:?}",
            route,
            result
        );
    }
    for route in ["/gone", "/bad"] {
        let result = sink.send(&send(route), &payload).await;
        assert!(
            matches!(result, Err(DeliveryError::Permanent(_))),
            "{} should be permanent, got {:?}",
            route,
            result
        );
    }
}

#[tokio::test]
async fn test_unreachable_webhook_is_retryable() {
    // Bind then drop to get a port nothing listens on
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let result = webhook(None)
        .send(&format!("http://127.0.0.1:{}/hook", port), &sample_payload())
        .await;
    assert!(matches!(result, Err(DeliveryError::Retryable(_))));
}

#[tokio::test]
async fn test_invalid_webhook_target_is_permanent() {
    let sink = webhook(None);
    let payload = sample_payload();
    assert!(matches!(
        sink.send("not a url", &payload).await,
        Err(DeliveryError::Permanent(_))
    ));
    assert!(matches!(
        sink.send("ftp://hooks.example.com/", &payload).await,
        Err(DeliveryError::Permanent(_))
    ));
}

const PAGE: &str = "<html><body><p>Version 1.0 is out.</p></body></html>";
const PAGE_EDITED: &str = "<html><body><p>Version 1.1 is out with fixes.</p></body></html>";

/// A harness whose runs queue webhook and in-app notifications
fn notifying_harness(hook: String) -> (Harness, Arc<NotificationDispatcher>, i64) {
    let storage = memory_storage();
    let config = NotificationsConfig {
        max_attempts: 2,
        ..NotificationsConfig::default()
    };
    let dispatcher = Arc::new(
        NotificationDispatcher::new(storage.clone(), config)
            .with_sink(Channel::Webhook, Arc::new(webhook(None))),
    );
    let harness = Harness::with_dispatcher(run_config(), storage, dispatcher.clone());
    let settings = NotificationSettings {
        channels: vec![ChannelSubscription {
            channel: Channel::Webhook,
            target: hook,
        }],
        ..NotificationSettings::default()
    };
    let website_id = harness.add_website("https://news.example.com/", "*/5 * * * *", settings);
    harness.site.page("/", PAGE);
    (harness, dispatcher, website_id)
}

async fn run_at(harness: &Harness, at: chrono::DateTime<Utc>) -> lapis_watch::crawler::RunOutcome {
    let report = harness.scheduler.tick_at(at).unwrap();
    report.join_all().await.remove(0).unwrap()
}

#[tokio::test]
async fn test_change_digest_delivered_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header(EVENT_HEADER, "change_digest"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (harness, dispatcher, _) = notifying_harness(format!("{}/hook", server.uri()));

    let baseline = run_at(&harness, t0()).await;
    assert!(baseline.notifications.is_empty());

    harness.site.page("/", PAGE_EDITED);
    let second = run_at(&harness, t0() + minutes(5)).await;
    assert_eq!(second.changes.len(), 1);
    assert_eq!(second.notifications.len(), 1);

    let report = dispatcher.deliver_due(Utc::now()).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.sent, 1);

    // A second pass finds nothing left to send
    let again = dispatcher.deliver_due(Utc::now()).await.unwrap();
    assert_eq!(again.attempted, 0);

    let tasks = lock_storage(&harness.storage)
        .unwrap()
        .run_notification_tasks(second.run.id)
        .unwrap();
    assert_eq!(tasks[0].state, DeliveryState::Sent);
    assert!(tasks[0].delivered_at.is_some());

    let requests = server.received_requests().await.unwrap();
    let digest = DigestPayload::from_json(std::str::from_utf8(&requests[0].body).unwrap()).unwrap();
    assert_eq!(digest.kind, TaskKind::ChangeDigest);
    assert_eq!(digest.event_ids(), vec![second.changes[0].id]);
    assert_eq!(digest.subject, "1 change detected on https://news.example.com/");
}

#[tokio::test]
async fn test_failing_webhook_is_retried_then_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (harness, dispatcher, _) = notifying_harness(format!("{}/hook", server.uri()));
    run_at(&harness, t0()).await;
    harness.site.page("/", PAGE_EDITED);
    let run = run_at(&harness, t0() + minutes(5)).await;

    let now = Utc::now();
    let first = dispatcher.deliver_due(now).await.unwrap();
    assert_eq!(first.retried, 1);

    let task = lock_storage(&harness.storage)
        .unwrap()
        .run_notification_tasks(run.run.id)
        .unwrap()
        .remove(0);
    assert_eq!(task.state, DeliveryState::FailedRetryable);
    assert_eq!(task.attempt_count, 1);
    assert!(task.next_attempt_at > now);
    assert!(task.last_error.unwrap().contains("500"));

    // Not due again until the backoff elapses
    assert_eq!(dispatcher.deliver_due(now).await.unwrap().attempted, 0);

    let later = now + chrono::Duration::hours(2);
    let second = dispatcher.deliver_due(later).await.unwrap();
    assert_eq!(second.failed_permanent, 1);

    let storage = lock_storage(&harness.storage).unwrap();
    let failed = storage.failed_notification_tasks().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempt_count, 2);
}
