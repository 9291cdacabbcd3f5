use url::Url;

/// Extracts the lowercase host from a URL
///
/// # Examples
///
/// ```
/// use url::Url;
/// use lapis_watch::url::extract_domain;
///
/// let url = Url::parse("https://Docs.Example.com/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("docs.example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Returns true when `candidate` is served by the same origin host as `root`
///
/// Scheme differences are tolerated so `http` links on an `https` site still
/// count; an explicit port must match.
pub fn same_host(root: &Url, candidate: &Url) -> bool {
    match (extract_domain(root), extract_domain(candidate)) {
        (Some(a), Some(b)) => {
            a == b
                && (root.port() == candidate.port()
                    || root.port_or_known_default() == candidate.port_or_known_default())
        }
        _ => false,
    }
}
