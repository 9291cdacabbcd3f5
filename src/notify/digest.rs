//! Notification payloads
//!
//! One [`DigestPayload`] is built per run and channel. It is stored as JSON
//! on the notification task and handed to the sink at delivery time.

use crate::state::{ChangeKind, ChangeType, RunStatus, TaskKind};
use crate::storage::{ChangeEventRecord, RunRecord, WebsiteRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of changes listed in the message text
const MESSAGE_CHANGE_LINES: usize = 20;

/// One change event as seen by notification consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub event_id: i64,
    pub url: String,
    pub change_type: ChangeType,
    pub kind: ChangeKind,
    pub severity: f64,
}

impl From<&ChangeEventRecord> for ChangeSummary {
    fn from(event: &ChangeEventRecord) -> Self {
        Self {
            event_id: event.id,
            url: event.url.clone(),
            change_type: event.change_type,
            kind: event.kind,
            severity: event.severity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestPayload {
    pub kind: TaskKind,
    pub website_id: i64,
    pub root_url: String,
    pub run_id: i64,
    pub run_status: RunStatus,
    pub pages_attempted: u32,
    pub pages_succeeded: u32,
    pub pages_failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub subject: String,
    pub message: String,
    pub changes: Vec<ChangeSummary>,
    pub generated_at: DateTime<Utc>,
}

impl DigestPayload {
    pub fn build(
        kind: TaskKind,
        website: &WebsiteRecord,
        run: &RunRecord,
        changes: &[&ChangeEventRecord],
        now: DateTime<Utc>,
    ) -> Self {
        let changes: Vec<ChangeSummary> = changes.iter().map(|e| ChangeSummary::from(*e)).collect();
        let subject = subject_line(kind, &website.root_url, changes.len());
        let message = message_text(kind, run, &changes);

        Self {
            kind,
            website_id: website.id,
            root_url: website.root_url.clone(),
            run_id: run.id,
            run_status: run.status,
            pages_attempted: run.pages_attempted,
            pages_succeeded: run.pages_succeeded,
            pages_failed: run.pages_failed,
            error_message: run.error_message.clone(),
            subject,
            message,
            changes,
            generated_at: now,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn event_ids(&self) -> Vec<i64> {
        self.changes.iter().map(|c| c.event_id).collect()
    }
}

fn subject_line(kind: TaskKind, root_url: &str, changes: usize) -> String {
    match kind {
        TaskKind::ChangeDigest if changes == 1 => format!("1 change detected on {}", root_url),
        TaskKind::ChangeDigest => format!("{} changes detected on {}", changes, root_url),
        TaskKind::RunCompleted => format!("Crawl of {} completed", root_url),
        TaskKind::RunFailed => format!("Crawl of {} failed", root_url),
    }
}

fn message_text(kind: TaskKind, run: &RunRecord, changes: &[ChangeSummary]) -> String {
    let mut lines = vec![format!(
        "Run {} {}: {} pages checked, {} succeeded, {} failed.",
        run.id, run.status, run.pages_attempted, run.pages_succeeded, run.pages_failed
    )];

    if let Some(error) = &run.error_message {
        lines.push(format!("Reason: {}", error));
    }

    if kind == TaskKind::ChangeDigest {
        for change in changes.iter().take(MESSAGE_CHANGE_LINES) {
            lines.push(format!(
                "- {} {} ({}, severity {:.2})",
                change.change_type, change.url, change.kind, change.severity
            ));
        }
        if changes.len() > MESSAGE_CHANGE_LINES {
            lines.push(format!(
                "...and {} more",
                changes.len() - MESSAGE_CHANGE_LINES
            ));
        }
    }

    lines.join("\n")
}
