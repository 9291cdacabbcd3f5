use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a detected change, as exposed to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Removed,
}

impl ChangeType {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Removed => "removed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Finer-grained reason behind a change type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// URL seen for the first time
    New,
    /// Tombstoned URL came back
    Reappeared,
    /// Text changed, skeleton unchanged
    Content,
    /// Tag skeleton changed
    Structural,
    /// Not found, or no longer linked from the site
    Gone,
    /// Now excluded by the website's crawl scope
    OutOfScope,
}

impl ChangeKind {
    /// The change type this kind belongs to
    pub fn change_type(&self) -> ChangeType {
        match self {
            Self::New | Self::Reappeared => ChangeType::Created,
            Self::Content | Self::Structural => ChangeType::Updated,
            Self::Gone | Self::OutOfScope => ChangeType::Removed,
        }
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Reappeared => "reappeared",
            Self::Content => "content",
            Self::Structural => "structural",
            Self::Gone => "gone",
            Self::OutOfScope => "out_of_scope",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "reappeared" => Some(Self::Reappeared),
            "content" => Some(Self::Content),
            "structural" => Some(Self::Structural),
            "gone" => Some(Self::Gone),
            "out_of_scope" => Some(Self::OutOfScope),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_maps_to_type() {
        assert_eq!(ChangeKind::New.change_type(), ChangeType::Created);
        assert_eq!(ChangeKind::Reappeared.change_type(), ChangeType::Created);
        assert_eq!(ChangeKind::Content.change_type(), ChangeType::Updated);
        assert_eq!(ChangeKind::Structural.change_type(), ChangeType::Updated);
        assert_eq!(ChangeKind::Gone.change_type(), ChangeType::Removed);
        assert_eq!(ChangeKind::OutOfScope.change_type(), ChangeType::Removed);
    }

    #[test]
    fn test_kind_db_strings() {
        for kind in [
            ChangeKind::New,
            ChangeKind::Reappeared,
            ChangeKind::Content,
            ChangeKind::Structural,
            ChangeKind::Gone,
            ChangeKind::OutOfScope,
        ] {
            assert_eq!(ChangeKind::from_db_string(kind.to_db_string()), Some(kind));
        }
    }

    #[test]
    fn test_serializes_snake_case() {
        let json = serde_json::to_string(&ChangeKind::OutOfScope).unwrap();
        assert_eq!(json, "\"out_of_scope\"");
    }
}
