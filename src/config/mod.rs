//! Configuration module for Lapis-Watch
//!
//! Loads, parses and validates the TOML configuration: scheduler and run
//! limits, hashing and severity tuning, notification delivery, storage
//! locations and the list of monitored websites.
//!
//! # Example
//!
//! ```no_run
//! use lapis_watch::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("lapis.toml")).unwrap();
//! println!("Tick interval: {}s", config.scheduler.tick_interval_secs);
//! ```

mod parser;
mod types;
mod validation;

pub use types::{
    ClassifierConfig, Config, HasherConfig, NotificationsConfig, RunConfig, SchedulerConfig,
    StorageConfig, UserAgentConfig, WebsiteEntry,
};

pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
