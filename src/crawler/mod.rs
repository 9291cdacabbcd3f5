//! Crawl run execution
//!
//! This module contains everything needed to execute one crawl run:
//! - The [`Fetcher`] abstraction and its reqwest implementation
//! - Link extraction from fetched HTML
//! - The per-run frontier (breadth-first, deduplicated, scoped)
//! - Retry policy for transient failures
//! - The [`RunCoordinator`] driving a run from `pending` to a terminal state

mod coordinator;
mod fetcher;
mod frontier;
mod parser;
mod retry;

pub use coordinator::{RunCoordinator, RunOutcome};
pub use fetcher::{
    build_http_client, user_agent_string, FetchError, FetchResponse, Fetcher, HttpFetcher,
};
pub use frontier::{Frontier, QueuedUrl};
pub use parser::extract_links;
pub use retry::RetryPolicy;
