use crate::UrlError;
use regex::Regex;
use url::Url;

/// Include/exclude rules that decide whether a URL belongs to a website's crawl
///
/// Patterns are globs where `*` matches any run of characters. A pattern
/// starting with `/` is matched against the URL path (plus query); any other
/// pattern is matched against the full URL. Exclusions win over inclusions,
/// and an empty include list admits every URL.
///
/// # Examples
///
/// ```
/// use lapis_watch::url::UrlScope;
/// use url::Url;
///
/// let scope = UrlScope::new(&["/docs/*".to_string()], &["*.pdf".to_string()]).unwrap();
/// assert!(scope.allows(&Url::parse("https://example.com/docs/intro").unwrap()));
/// assert!(!scope.allows(&Url::parse("https://example.com/docs/manual.pdf").unwrap()));
/// assert!(!scope.allows(&Url::parse("https://example.com/blog").unwrap()));
/// ```
#[derive(Debug, Clone)]
pub struct UrlScope {
    include: Vec<ScopePattern>,
    exclude: Vec<ScopePattern>,
}

#[derive(Debug, Clone)]
struct ScopePattern {
    regex: Regex,
    path_only: bool,
}

impl ScopePattern {
    fn compile(pattern: &str) -> Result<Self, UrlError> {
        if pattern.trim().is_empty() {
            return Err(UrlError::InvalidPattern {
                pattern: pattern.to_string(),
                message: "pattern cannot be empty".to_string(),
            });
        }

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{}$", body)).map_err(|e| UrlError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            regex,
            path_only: pattern.starts_with('/'),
        })
    }

    fn matches(&self, url: &Url) -> bool {
        if self.path_only {
            let target = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
            self.regex.is_match(&target)
        } else {
            self.regex.is_match(url.as_str())
        }
    }
}

impl UrlScope {
    /// Compiles include and exclude globs
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, UrlError> {
        Ok(Self {
            include: include
                .iter()
                .map(|p| ScopePattern::compile(p))
                .collect::<Result<_, _>>()?,
            exclude: exclude
                .iter()
                .map(|p| ScopePattern::compile(p))
                .collect::<Result<_, _>>()?,
        })
    }

    /// A scope that admits every URL
    pub fn allow_all() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn allows(&self, url: &Url) -> bool {
        if self.exclude.iter().any(|p| p.matches(url)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.matches(url))
    }
}
