//! Statistics generation from the crawl ledger
//!
//! Gathers ledger-wide counts, the state of every website and the
//! notifications that failed permanently, for display by the CLI.

use crate::state::{ChangeType, DeliveryState, PageState, RunStatus};
use crate::storage::{
    LedgerStats, NotificationTaskRecord, RunRecord, ScheduleRecord, Storage, WebsiteRecord,
};
use crate::WatchError;
use std::fmt::Write as _;

/// One website with its schedule and latest run
#[derive(Debug, Clone)]
pub struct WebsiteSummary {
    pub website: WebsiteRecord,
    pub schedule: Option<ScheduleRecord>,
    pub last_run: Option<RunRecord>,
}

#[derive(Debug, Clone)]
pub struct WatchStatistics {
    pub ledger: LedgerStats,
    pub websites: Vec<WebsiteSummary>,
    /// Operational alerts: tasks that exhausted delivery
    pub failed_notifications: Vec<NotificationTaskRecord>,
}

/// Loads statistics from storage
pub fn load_statistics(storage: &dyn Storage) -> Result<WatchStatistics, WatchError> {
    let ledger = storage.ledger_stats()?;

    let mut websites = Vec::new();
    for website in storage.list_websites()? {
        let schedule = storage.get_schedule(website.id)?;
        let last_run = storage.list_runs(website.id, 1)?.into_iter().next();
        websites.push(WebsiteSummary {
            website,
            schedule,
            last_run,
        });
    }

    let failed_notifications = storage.failed_notification_tasks()?;

    Ok(WatchStatistics {
        ledger,
        websites,
        failed_notifications,
    })
}

/// Renders statistics as plain text
pub fn format_statistics(stats: &WatchStatistics) -> String {
    let ledger = &stats.ledger;
    let mut out = String::new();

    let _ = writeln!(out, "=== Lapis-Watch Statistics ===\n");
    let _ = writeln!(out, "Overview:");
    let _ = writeln!(out, "  Websites: {}", ledger.websites);
    let _ = writeln!(out, "  Active schedules: {}", ledger.active_schedules);
    let _ = writeln!(out, "  Degraded pages: {}", ledger.degraded_pages);
    let _ = writeln!(out);

    let _ = writeln!(out, "Runs:");
    for status in [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ] {
        let count = ledger.runs_by_status.get(&status).copied().unwrap_or(0);
        let _ = writeln!(out, "  {}: {}", status, count);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Pages:");
    for state in [PageState::Live, PageState::Tombstoned] {
        let count = ledger.pages_by_state.get(&state).copied().unwrap_or(0);
        let _ = writeln!(out, "  {}: {}", state, count);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Changes:");
    for change_type in [ChangeType::Created, ChangeType::Updated, ChangeType::Removed] {
        let count = ledger.changes_by_type.get(&change_type).copied().unwrap_or(0);
        let _ = writeln!(out, "  {}: {}", change_type, count);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Notifications:");
    for state in [
        DeliveryState::Queued,
        DeliveryState::Sent,
        DeliveryState::FailedRetryable,
        DeliveryState::FailedPermanent,
    ] {
        let count = ledger.tasks_by_state.get(&state).copied().unwrap_or(0);
        let _ = writeln!(out, "  {}: {}", state, count);
    }
    let _ = writeln!(out);

    if !stats.websites.is_empty() {
        let _ = writeln!(out, "Websites ({}):", stats.websites.len());
        for summary in &stats.websites {
            let schedule = match &summary.schedule {
                Some(s) if s.active => format!("'{}', next due {}", s.expression, s.next_due),
                Some(s) => format!("'{}', inactive", s.expression),
                None => "unscheduled".to_string(),
            };
            let last_run = match &summary.last_run {
                Some(run) => format!(
                    "run {} {} ({}/{} pages ok)",
                    run.id, run.status, run.pages_succeeded, run.pages_attempted
                ),
                None => "never crawled".to_string(),
            };
            let _ = writeln!(
                out,
                "  - {} [{}] {}; {}",
                summary.website.root_url,
                if summary.website.is_crawlable() { "active" } else { "paused" },
                schedule,
                last_run
            );
        }
        let _ = writeln!(out);
    }

    if !stats.failed_notifications.is_empty() {
        let _ = writeln!(
            out,
            "ALERTS: {} notifications failed permanently",
            stats.failed_notifications.len()
        );
        for task in &stats.failed_notifications {
            let _ = writeln!(
                out,
                "  - task {} (run {}, {} to {}) after {} attempts: {}",
                task.id,
                task.run_id,
                task.channel,
                task.target,
                task.attempt_count,
                task.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    out
}

/// Prints statistics to stdout
pub fn print_statistics(stats: &WatchStatistics) {
    print!("{}", format_statistics(stats));
}
