//! Link extraction from fetched HTML
//!
//! **Followed:** `<a href>` and `<link rel="canonical" href>`.
//!
//! **Skipped:** `<a download>`, fragment-only links, and `javascript:`,
//! `mailto:`, `tel:` and `data:` hrefs. `rel="nofollow"` links are followed.

use scraper::{Html, Selector};
use url::Url;

/// Extracts absolute http(s) links from an HTML document
///
/// Relative links are resolved against `base_url` (or the document's
/// `<base href>` when present). Duplicates are kept in document order; the
/// frontier deduplicates.
///
/// # Example
///
/// ```
/// use lapis_watch::crawler::extract_links;
/// use url::Url;
///
/// let html = r#"<a href="/pricing">Pricing</a><a href="mailto:a@b.c">Mail</a>"#;
/// let base = Url::parse("https://example.com/").unwrap();
/// let links = extract_links(html, &base);
/// assert_eq!(links, vec![Url::parse("https://example.com/pricing").unwrap()]);
/// ```
pub fn extract_links(html: &str, base_url: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let base = document_base(&document, base_url);
    let mut links = Vec::new();

    if let Ok(a_selector) = Selector::parse("a[href]") {
        for element in document.select(&a_selector) {
            if element.value().attr("download").is_some() {
                continue;
            }
            if let Some(url) = element.value().attr("href").and_then(|h| resolve_link(h, &base)) {
                links.push(url);
            }
        }
    }

    if let Ok(canonical_selector) = Selector::parse("link[rel='canonical'][href]") {
        for element in document.select(&canonical_selector) {
            if let Some(url) = element.value().attr("href").and_then(|h| resolve_link(h, &base)) {
                links.push(url);
            }
        }
    }

    links
}

fn document_base(document: &Html, fallback: &Url) -> Url {
    Selector::parse("base[href]")
        .ok()
        .and_then(|selector| {
            document
                .select(&selector)
                .next()
                .and_then(|element| element.value().attr("href"))
                .and_then(|href| fallback.join(href.trim()).ok())
        })
        .unwrap_or_else(|| fallback.clone())
}

/// Resolves an href, rejecting non-navigational schemes
fn resolve_link(href: &str, base_url: &Url) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lower = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return None;
    }

    let absolute = base_url.join(href).ok()?;
    matches!(absolute.scheme(), "http" | "https").then_some(absolute)
}
