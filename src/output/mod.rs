//! Reporting on the crawl ledger for the command line

pub mod stats;

pub use stats::{format_statistics, load_statistics, print_statistics, WatchStatistics, WebsiteSummary};
