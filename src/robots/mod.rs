//! Robots.txt handling module
//!
//! robots.txt is fetched once per run through the same [`Fetcher`] that
//! crawls the pages, so tests and alternative fetchers see it too.

mod parser;

pub use parser::RobotsRules;

use crate::crawler::{FetchError, Fetcher};
use crate::storage::CrawlSettings;
use tracing::{debug, warn};
use url::Url;

/// Fetches and parses `/robots.txt` for the website rooted at `root`
///
/// A missing file (4xx) allows everything. Server errors and transient
/// failures also fall back to allow-all, with a warning. A systemic fetch
/// error is returned so the run can fail.
pub async fn fetch_robots(
    fetcher: &dyn Fetcher,
    root: &Url,
    settings: &CrawlSettings,
    agent: &str,
) -> Result<RobotsRules, FetchError> {
    let robots_url = match root.join("/robots.txt") {
        Ok(url) => url,
        Err(_) => return Ok(RobotsRules::allow_all()),
    };

    match fetcher.fetch(&robots_url, settings).await {
        Ok(response) if (200..300).contains(&response.status_code) => {
            let content = String::from_utf8_lossy(&response.body);
            debug!("Loaded robots.txt from {} ({} bytes)", robots_url, content.len());
            Ok(RobotsRules::from_content(&content, agent))
        }
        Ok(response) if (400..500).contains(&response.status_code) => {
            debug!("No robots.txt at {} (HTTP {})", robots_url, response.status_code);
            Ok(RobotsRules::allow_all())
        }
        Ok(response) => {
            warn!(
                "robots.txt at {} returned HTTP {}, allowing all",
                robots_url, response.status_code
            );
            Ok(RobotsRules::allow_all())
        }
        Err(FetchError::Transient(e)) => {
            warn!("Failed to fetch robots.txt from {}: {}", robots_url, e);
            Ok(RobotsRules::allow_all())
        }
        Err(e) => Err(e),
    }
}
