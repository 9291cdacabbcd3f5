//! The reqwest fetcher against a live local server

use lapis_watch::config::UserAgentConfig;
use lapis_watch::crawler::{user_agent_string, FetchError, Fetcher, HttpFetcher};
use lapis_watch::robots::fetch_robots;
use lapis_watch::storage::CrawlSettings;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn user_agent() -> UserAgentConfig {
    UserAgentConfig {
        crawler_name: "LapisTest".to_string(),
        crawler_version: "1.0.0".to_string(),
        contact_url: "https://example.com/contact".to_string(),
        contact_email: "test@example.com".to_string(),
    }
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(&user_agent(), Duration::from_secs(5)).unwrap()
}

fn url(server: &MockServer, route: &str) -> Url {
    Url::parse(&format!("{}{}", server.uri(), route)).unwrap()
}

#[tokio::test]
async fn test_fetch_page_with_links() {
    let server = MockServer::start().await;
    let agent = user_agent_string(&user_agent());
    Mock::given(method("GET"))
        .and(path("/"))
        .and(header("user-agent", agent.as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    r#"<html><body><a href="/guide">Guide</a><a href="mailto:x@example.com">Mail</a></body></html>"#,
                    "text/html",
                )
                .insert_header("ETag", "\"v1\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    let response = fetcher()
        .fetch(&url(&server, "/"), &CrawlSettings::default())
        .await
        .unwrap();
    assert!(response.is_success());
    assert!(response.content_type().unwrap().starts_with("text/html"));
    assert_eq!(response.headers.get("etag").map(String::as_str), Some("\"v1\""));
    assert_eq!(response.discovered_links, vec![url(&server, "/guide")]);
}

#[tokio::test]
async fn test_missing_page_is_gone() {
    let server = MockServer::start().await;
    let response = fetcher()
        .fetch(&url(&server, "/nowhere"), &CrawlSettings::default())
        .await
        .unwrap();
    assert_eq!(response.status_code, 404);
    assert!(response.is_gone());
    assert!(response.discovered_links.is_empty());
}

#[tokio::test]
async fn test_server_error_is_retryable_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let response = fetcher()
        .fetch(&url(&server, "/flaky"), &CrawlSettings::default())
        .await
        .unwrap();
    assert!(response.is_retryable());
    assert!(!response.is_gone());
}

#[tokio::test]
async fn test_redirect_reports_final_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>moved</p>"))
        .mount(&server)
        .await;

    let response = fetcher()
        .fetch(&url(&server, "/old"), &CrawlSettings::default())
        .await
        .unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.final_url, url(&server, "/new"));
}

#[tokio::test]
async fn test_refused_connection_is_transient() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let target = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
    let result = fetcher().fetch(&target, &CrawlSettings::default()).await;
    assert!(matches!(result, Err(FetchError::Transient(_))));
}

#[tokio::test]
async fn test_robots_rules_from_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("User-agent: *\nDisallow: /private/\n"),
        )
        .mount(&server)
        .await;

    let fetcher = fetcher();
    let rules = fetch_robots(&fetcher, &url(&server, "/"), &CrawlSettings::default(), "LapisTest")
        .await
        .unwrap();
    assert!(rules.is_allowed(&url(&server, "/docs")));
    assert!(!rules.is_allowed(&url(&server, "/private/keys")));
}

#[tokio::test]
async fn test_missing_robots_allows_everything() {
    let server = MockServer::start().await;
    let fetcher = fetcher();
    let rules = fetch_robots(&fetcher, &url(&server, "/"), &CrawlSettings::default(), "LapisTest")
        .await
        .unwrap();
    assert!(rules.is_allowed(&url(&server, "/private/keys")));
}
