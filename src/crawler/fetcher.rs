//! Page fetching
//!
//! The crawl engine never talks HTTP directly: it asks a [`Fetcher`] for the
//! raw bytes behind a URL. [`HttpFetcher`] is the reqwest-based
//! implementation used by the binary; tests plug in scripted fetchers.

use crate::config::UserAgentConfig;
use crate::crawler::parser::extract_links;
use crate::storage::CrawlSettings;
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Failure to obtain a response at all
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// Per-page failure (DNS, connect, timeout, reset); retried locally
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The fetcher itself is unusable; fails the whole run
    #[error("systemic fetch failure: {0}")]
    Systemic(String),
}

/// A response from the fetcher, whatever its status code
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status_code: u16,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// URL after redirects
    pub final_url: Url,
    /// Absolute links found in the body
    pub discovered_links: Vec<Url>,
}

impl FetchResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// 404 Not Found and 410 Gone remove a page
    pub fn is_gone(&self) -> bool {
        self.status_code == 404 || self.status_code == 410
    }

    /// 429 and 5xx are worth another attempt
    pub fn is_retryable(&self) -> bool {
        self.status_code == 429 || (500..600).contains(&self.status_code)
    }
}

/// Source of page bytes for the crawl engine
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url, settings: &CrawlSettings)
        -> Result<FetchResponse, FetchError>;
}

/// Formats the crawler's user agent: `Name/Version (+ContactURL; ContactEmail)`
pub fn user_agent_string(config: &UserAgentConfig) -> String {
    format!(
        "{}/{} (+{}; {})",
        config.crawler_name, config.crawler_version, config.contact_url, config.contact_email
    )
}

/// Builds the HTTP client shared by the fetcher
///
/// # Arguments
///
/// * `config` - The user agent configuration
/// * `timeout` - Total timeout for one request
pub fn build_http_client(
    config: &UserAgentConfig,
    timeout: Duration,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(user_agent_string(config))
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Fetcher backed by a reqwest client
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &UserAgentConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config, timeout)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &Url,
        _settings: &CrawlSettings,
    ) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_error)?;

        let status_code = response.status().as_u16();
        let final_url = response.url().clone();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(classify_error)?.to_vec();

        let is_html = headers
            .get("content-type")
            .map(|ct| ct.contains("html"))
            .unwrap_or(true);
        let discovered_links = match std::str::from_utf8(&body) {
            Ok(text) if is_html && (200..300).contains(&status_code) => {
                extract_links(text, &final_url)
            }
            _ => Vec::new(),
        };

        Ok(FetchResponse {
            status_code,
            headers,
            body,
            final_url,
            discovered_links,
        })
    }
}

/// Maps reqwest errors onto the engine's two failure classes
fn classify_error(error: reqwest::Error) -> FetchError {
    if error.is_builder() {
        FetchError::Systemic(error.to_string())
    } else if error.is_timeout() {
        FetchError::Transient("request timed out".to_string())
    } else if error.is_connect() {
        FetchError::Transient(format!("connection failed: {}", error))
    } else {
        FetchError::Transient(error.to_string())
    }
}
