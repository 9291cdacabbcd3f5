use std::fmt;

/// Liveness of a tracked page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    /// Page was present the last time it was fetched
    Live,

    /// Page disappeared (404/410 or dropped out of the crawl); content fields are retained
    Tombstoned,
}

impl PageState {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Tombstoned => "tombstoned",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "live" => Some(Self::Live),
            "tombstoned" => Some(Self::Tombstoned),
            _ => None,
        }
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Non-fatal problem recorded against a page during its latest observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageIssue {
    /// Content could not be parsed; only a raw-bytes hash is available
    ParseDegraded,

    /// Classification against the stored record failed
    ClassificationError,
}

impl PageIssue {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::ParseDegraded => "parse_degraded",
            Self::ClassificationError => "classification_error",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "parse_degraded" => Some(Self::ParseDegraded),
            "classification_error" => Some(Self::ClassificationError),
            _ => None,
        }
    }
}

impl fmt::Display for PageIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
