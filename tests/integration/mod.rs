//! Integration tests for lapis-watch
//!
//! Crawls run against scripted in-process sites or wiremock servers; the
//! ledger is an in-memory or temporary SQLite database.

mod change_detection;
mod http_fetcher;
mod notifications;
mod scheduling;
mod support;
