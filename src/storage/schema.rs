//! Database schema definitions
//!
//! Timestamps are RFC 3339 text with microsecond precision in UTC, so they
//! compare correctly as strings.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Monitored websites (soft-deleted via deleted_at)
CREATE TABLE IF NOT EXISTS websites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    root_url TEXT NOT NULL UNIQUE,
    crawl_settings TEXT NOT NULL,
    notification_settings TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    deleted_at TEXT
);

-- One schedule per website
CREATE TABLE IF NOT EXISTS schedules (
    website_id INTEGER PRIMARY KEY REFERENCES websites(id),
    expression TEXT NOT NULL,
    last_run TEXT,
    next_due TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(active, next_due);

-- Crawl runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    website_id INTEGER NOT NULL REFERENCES websites(id),
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    pages_attempted INTEGER NOT NULL DEFAULT 0,
    pages_succeeded INTEGER NOT NULL DEFAULT 0,
    pages_failed INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_website ON runs(website_id);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

-- Per-website single-flight lock with a lease for crash recovery
CREATE TABLE IF NOT EXISTS run_locks (
    website_id INTEGER PRIMARY KEY REFERENCES websites(id),
    run_id INTEGER NOT NULL REFERENCES runs(id),
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

-- Latest fingerprint per page; never deleted
CREATE TABLE IF NOT EXISTS pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    website_id INTEGER NOT NULL REFERENCES websites(id),
    url TEXT NOT NULL,
    full_hash TEXT NOT NULL,
    structural_hash TEXT,
    content_length INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    issue TEXT,
    last_seen_run INTEGER NOT NULL REFERENCES runs(id),
    first_seen_at TEXT NOT NULL,
    last_modified TEXT NOT NULL,
    UNIQUE(website_id, url)
);

CREATE INDEX IF NOT EXISTS idx_pages_website_state ON pages(website_id, state);

-- Append-only change history
CREATE TABLE IF NOT EXISTS change_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id INTEGER NOT NULL REFERENCES pages(id),
    website_id INTEGER NOT NULL REFERENCES websites(id),
    run_id INTEGER NOT NULL REFERENCES runs(id),
    url TEXT NOT NULL,
    change_type TEXT NOT NULL,
    change_kind TEXT NOT NULL,
    old_hash TEXT,
    new_hash TEXT,
    severity REAL NOT NULL,
    detected_at TEXT NOT NULL,
    UNIQUE(page_id, run_id)
);

CREATE INDEX IF NOT EXISTS idx_change_events_run ON change_events(run_id);

-- Outbound notifications
CREATE TABLE IF NOT EXISTS notification_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    website_id INTEGER NOT NULL REFERENCES websites(id),
    run_id INTEGER NOT NULL REFERENCES runs(id),
    channel TEXT NOT NULL,
    target TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT NOT NULL,
    last_error TEXT,
    created_at TEXT NOT NULL,
    delivered_at TEXT,
    UNIQUE(run_id, channel, target)
);

CREATE INDEX IF NOT EXISTS idx_notification_tasks_due ON notification_tasks(state, next_attempt_at);

-- Notifications shown inside the application
CREATE TABLE IF NOT EXISTS in_app_notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_in_app_user ON in_app_notifications(user_id);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
