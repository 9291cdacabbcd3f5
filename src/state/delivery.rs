//! Notification task bookkeeping types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery state of a notification task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    Queued,
    Sent,
    FailedRetryable,
    FailedPermanent,
}

impl DeliveryState {
    /// Returns true if the dispatcher should still attempt delivery
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::FailedRetryable)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "sent" => Some(Self::Sent),
            "failed_retryable" => Some(Self::FailedRetryable),
            "failed_permanent" => Some(Self::FailedPermanent),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Notification channel a subscription targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    Email,
    Webhook,
    InApp,
}

impl Channel {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::InApp => "in_app",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Self::Email),
            "webhook" => Some(Self::Webhook),
            "in_app" => Some(Self::InApp),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// What a notification task reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Coalesced digest of the changes detected by one run
    ChangeDigest,
    RunCompleted,
    RunFailed,
}

impl TaskKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::ChangeDigest => "change_digest",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "change_digest" => Some(Self::ChangeDigest),
            "run_completed" => Some(Self::RunCompleted),
            "run_failed" => Some(Self::RunFailed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
