//! Change classification between crawl generations
//!
//! The classifier compares a fresh [`Fingerprint`] against the stored
//! [`PageRecord`] and decides whether a change event is due, of which kind,
//! and how severe it is. It is a pure function of its inputs; persistence
//! is left to the caller.

mod severity;

pub use severity::content_severity;

use crate::config::ClassifierConfig;
use crate::hasher::Fingerprint;
use crate::state::{ChangeKind, ChangeType, PageState};
use crate::storage::{NewChangeEvent, PageRecord};
use thiserror::Error;

/// Errors raised while comparing against a stored record
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("Stored {field} for {url} is not a SHA-256 digest: '{value}'")]
    CorruptHash {
        url: String,
        field: &'static str,
        value: String,
    },

    #[error("Removal kind must be gone or out_of_scope, got {0}")]
    InvalidRemovalKind(ChangeKind),
}

/// Outcome of comparing a page against its previous generation
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Fingerprint matches the stored record
    Unchanged,
    Changed(NewChangeEvent),
}

impl Classification {
    pub fn into_change(self) -> Option<NewChangeEvent> {
        match self {
            Classification::Unchanged => None,
            Classification::Changed(change) => Some(change),
        }
    }
}

/// Classifies fingerprints into change events
#[derive(Debug, Clone)]
pub struct ChangeClassifier {
    config: ClassifierConfig,
}

impl ChangeClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Compares a new fingerprint with the page's previous record
    ///
    /// # Rules
    ///
    /// | Previous | Fingerprint | Result |
    /// |----------|-------------|--------|
    /// | none | any | created / new, severity 1.0 |
    /// | tombstoned | any | created / reappeared, severity 1.0 |
    /// | live | structural hash differs | updated / structural |
    /// | live | full hash differs | updated / content, scored by size |
    /// | live | identical | unchanged |
    ///
    /// A structural change wins over a content change. Moving between a
    /// degraded fingerprint (no structural hash) and a parsed one counts as
    /// structural.
    pub fn classify(
        &self,
        previous: Option<&PageRecord>,
        new: &Fingerprint,
    ) -> Result<Classification, ClassificationError> {
        let previous = match previous {
            None => return Ok(created(ChangeKind::New, new)),
            Some(page) if page.state == PageState::Tombstoned => {
                // The previous generation is not carried across a removal
                return Ok(created(ChangeKind::Reappeared, new));
            }
            Some(page) => page,
        };

        check_digest(&previous.url, "full_hash", &previous.full_hash)?;
        if let Some(structural) = &previous.structural_hash {
            check_digest(&previous.url, "structural_hash", structural)?;
        }

        if previous.structural_hash != new.structural_hash {
            return Ok(Classification::Changed(NewChangeEvent {
                change_type: ChangeType::Updated,
                kind: ChangeKind::Structural,
                old_hash: Some(previous.full_hash.clone()),
                new_hash: Some(new.full_hash.clone()),
                severity: self.config.structural_severity,
            }));
        }

        if previous.full_hash == new.full_hash {
            return Ok(Classification::Unchanged);
        }

        Ok(Classification::Changed(NewChangeEvent {
            change_type: ChangeType::Updated,
            kind: ChangeKind::Content,
            old_hash: Some(previous.full_hash.clone()),
            new_hash: Some(new.full_hash.clone()),
            severity: content_severity(&self.config, previous.content_length, new.content_length),
        }))
    }

    /// Builds the removal event for a page that disappeared
    ///
    /// # Returns
    ///
    /// * `Ok(Some(event))` - The page was live and should be tombstoned
    /// * `Ok(None)` - The page is already tombstoned; nothing to emit
    pub fn removal(
        &self,
        previous: &PageRecord,
        kind: ChangeKind,
    ) -> Result<Option<NewChangeEvent>, ClassificationError> {
        if kind.change_type() != ChangeType::Removed {
            return Err(ClassificationError::InvalidRemovalKind(kind));
        }
        if previous.state == PageState::Tombstoned {
            return Ok(None);
        }

        Ok(Some(NewChangeEvent {
            change_type: ChangeType::Removed,
            kind,
            old_hash: Some(previous.full_hash.clone()),
            new_hash: None,
            severity: self.config.removed_severity,
        }))
    }
}

fn created(kind: ChangeKind, new: &Fingerprint) -> Classification {
    Classification::Changed(NewChangeEvent {
        change_type: ChangeType::Created,
        kind,
        old_hash: None,
        new_hash: Some(new.full_hash.clone()),
        severity: 1.0,
    })
}

fn check_digest(url: &str, field: &'static str, value: &str) -> Result<(), ClassificationError> {
    if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ClassificationError::CorruptHash {
            url: url.to_string(),
            field,
            value: value.to_string(),
        })
    }
}
