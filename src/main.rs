//! Lapis-Watch main entry point
//!
//! Command-line interface for the website change-detection engine.

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use lapis_watch::config::{load_config_with_hash, Config};
use lapis_watch::engine::{plan_website, Engine};
use lapis_watch::output::{load_statistics, print_statistics};
use lapis_watch::storage::{lock_storage, open_storage};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Lapis-Watch: website change detection on a schedule
///
/// Crawls every configured website on its own cron schedule, fingerprints
/// each page, records what was created, updated or removed since the
/// previous crawl, and notifies subscribers once per run.
#[derive(Parser, Debug)]
#[command(name = "lapis-watch")]
#[command(version)]
#[command(about = "Website change detection and crawl scheduling", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Run one scheduling pass, wait for its runs, deliver notifications and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats", "trigger"])]
    once: bool,

    /// Validate config and show websites with their next scheduled occurrence
    #[arg(long, conflicts_with_all = ["once", "stats", "trigger"])]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with_all = ["once", "dry_run", "trigger"])]
    stats: bool,

    /// Crawl one configured website now, outside its schedule, and exit
    #[arg(long, value_name = "URL", conflicts_with_all = ["once", "dry_run", "stats"])]
    trigger: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config)
    } else if cli.stats {
        handle_stats(&config)
    } else if cli.once {
        handle_once(config).await
    } else if let Some(url) = cli.trigger {
        handle_trigger(config, &url).await
    } else {
        handle_daemon(config).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("lapis_watch=info,warn"),
            1 => EnvFilter::new("lapis_watch=debug,info"),
            2 => EnvFilter::new("lapis_watch=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: validates config and shows what would be scheduled
fn handle_dry_run(config: &Config) -> anyhow::Result<()> {
    println!("=== Lapis-Watch Dry Run ===\n");

    println!("Scheduler:");
    println!("  Tick interval: {}s", config.scheduler.tick_interval_secs);
    println!("  Max concurrent runs: {}", config.scheduler.max_concurrent_runs);
    println!("  Lock lease: {}s", config.scheduler.lock_lease_secs);

    println!("\nRuns:");
    println!("  Fetch timeout: {}s", config.run.fetch_timeout_secs);
    println!("  Run timeout: {}s", config.run.run_timeout_secs);
    println!("  Fetch attempts: {}", config.run.max_fetch_attempts);

    println!("\nUser Agent:");
    println!("  Name: {}", config.user_agent.crawler_name);
    println!("  Version: {}", config.user_agent.crawler_version);
    println!("  Contact URL: {}", config.user_agent.contact_url);
    println!("  Contact Email: {}", config.user_agent.contact_email);

    println!("\nStorage:");
    println!("  Database: {}", config.storage.database_path);
    match &config.storage.body_store_path {
        Some(path) => println!("  Bodies: {}", path),
        None => println!("  Bodies: not kept"),
    }
    match config.storage.retention_days {
        0 => println!("  Retention: forever"),
        days => println!("  Retention: {} days", days),
    }

    let now = Utc::now();
    println!("\nWebsites ({}):", config.websites.len());
    for entry in &config.websites {
        let (website, expression, next_due) = plan_website(entry, now)?;
        println!(
            "  - {} [{}] '{}' next occurrence {}",
            website.root_url,
            if website.active { "active" } else { "paused" },
            expression,
            next_due
        );
        println!(
            "    max {} pages, depth {}, concurrency {}, {} notification channels",
            website.crawl.max_pages,
            website.crawl.max_depth,
            website.crawl.concurrency,
            website.notifications.channels.len()
        );
    }

    println!("\n✓ Configuration is valid");
    Ok(())
}

/// Handles the --stats mode: shows statistics and alerts from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.storage.database_path);

    let storage = open_storage(Path::new(&config.storage.database_path))
        .context("failed to open database")?;
    let stats = {
        let storage = lock_storage(&storage)?;
        load_statistics(&*storage)?
    };

    print_statistics(&stats);
    Ok(())
}

/// Handles the --once mode
async fn handle_once(config: Config) -> anyhow::Result<()> {
    let engine = Engine::new(config)?;
    engine.sync_websites(Utc::now())?;

    let report = engine.run_once().await?;
    for outcome in &report.outcomes {
        match outcome {
            Ok(outcome) => println!(
                "Run {} (website {}): {}, {} changes, {} notifications queued",
                outcome.run.id,
                outcome.run.website_id,
                outcome.status(),
                outcome.changes.len(),
                outcome.notifications.len()
            ),
            Err(e) => eprintln!("Run failed: {}", e),
        }
    }
    println!(
        "Notifications: {} sent, {} retrying, {} failed",
        report.delivery.sent, report.delivery.retried, report.delivery.failed_permanent
    );
    if let Some(pruned) = &report.pruned {
        println!(
            "Pruned: {} notifications, {} in-app notifications, {} stale bodies",
            pruned.notification_tasks,
            pruned.in_app_notifications,
            pruned.stale_body_hashes.len()
        );
    }

    Ok(())
}

/// Handles --trigger: one unscheduled run of a configured website
async fn handle_trigger(config: Config, url: &str) -> anyhow::Result<()> {
    let engine = Engine::new(config)?;
    engine.sync_websites(Utc::now())?;

    let Some(run) = engine.trigger(url)? else {
        println!("A run of {} is already in progress", url);
        return Ok(());
    };
    let outcome = run
        .handle
        .await
        .with_context(|| format!("run {} task failed", run.run_id))??;
    println!(
        "Run {} (website {}): {}, {} changes, {} notifications queued",
        outcome.run.id,
        outcome.run.website_id,
        outcome.status(),
        outcome.changes.len(),
        outcome.notifications.len()
    );

    let delivery = engine.dispatcher().deliver_due(Utc::now()).await?;
    println!(
        "Notifications: {} sent, {} retrying, {} failed",
        delivery.sent, delivery.retried, delivery.failed_permanent
    );
    Ok(())
}

/// Handles the default daemon mode: runs until Ctrl-C
async fn handle_daemon(config: Config) -> anyhow::Result<()> {
    let engine = Engine::new(config)?;
    let sync = engine.sync_websites(Utc::now())?;
    tracing::info!(
        "Watching {} websites ({} removed from config)",
        sync.synced.len(),
        sync.removed.len()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would stop the loops
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    engine.run(shutdown_rx).await;
    tracing::info!("Lapis-Watch stopped");
    Ok(())
}
