use crate::config::types::{
    ClassifierConfig, Config, HasherConfig, NotificationsConfig, RunConfig, SchedulerConfig,
    StorageConfig, UserAgentConfig, WebsiteEntry,
};
use crate::scheduler::CronExpr;
use crate::state::Channel;
use crate::storage::NotificationSettings;
use crate::url::UrlScope;
use crate::ConfigError;
use regex::Regex;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_scheduler_config(&config.scheduler)?;
    validate_run_config(&config.run)?;
    validate_hasher_config(&config.hasher)?;
    validate_classifier_config(&config.classifier)?;
    validate_notifications_config(&config.notifications)?;
    validate_storage_config(&config.storage)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_websites(&config.websites)?;

    // Runs must finish draining before their lease can be reclaimed
    let max_run_secs = config.run.max_run_secs();
    if config.scheduler.lock_lease_secs <= max_run_secs {
        return Err(ConfigError::Validation(format!(
            "lock-lease-secs ({}) must exceed the longest possible run ({}s: \
             run-timeout-secs plus draining fetches and retry backoff)",
            config.scheduler.lock_lease_secs, max_run_secs
        )));
    }

    Ok(())
}

fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.tick_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "tick-interval-secs must be >= 1".to_string(),
        ));
    }

    if config.max_concurrent_runs < 1 {
        return Err(ConfigError::Validation(format!(
            "max-concurrent-runs must be >= 1, got {}",
            config.max_concurrent_runs
        )));
    }

    if config.lock_lease_secs < 60 {
        return Err(ConfigError::Validation(format!(
            "lock-lease-secs must be >= 60, got {}",
            config.lock_lease_secs
        )));
    }

    Ok(())
}

fn validate_run_config(config: &RunConfig) -> Result<(), ConfigError> {
    if config.fetch_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "fetch-timeout-secs must be >= 1".to_string(),
        ));
    }

    if config.run_timeout_secs < config.fetch_timeout_secs {
        return Err(ConfigError::Validation(format!(
            "run-timeout-secs ({}) must be >= fetch-timeout-secs ({})",
            config.run_timeout_secs, config.fetch_timeout_secs
        )));
    }

    if config.max_fetch_attempts < 1 || config.max_fetch_attempts > 10 {
        return Err(ConfigError::Validation(format!(
            "max-fetch-attempts must be between 1 and 10, got {}",
            config.max_fetch_attempts
        )));
    }

    if config.retry_base_delay_ms > config.retry_max_delay_ms {
        return Err(ConfigError::Validation(
            "retry-base-delay-ms cannot exceed retry-max-delay-ms".to_string(),
        ));
    }

    Ok(())
}

fn validate_hasher_config(config: &HasherConfig) -> Result<(), ConfigError> {
    for pattern in &config.volatile_patterns {
        Regex::new(pattern).map_err(|e| {
            ConfigError::InvalidPattern(format!("volatile pattern '{}': {}", pattern, e))
        })?;
    }

    if config.volatile_attributes.iter().any(|a| a.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "volatile-attributes cannot contain empty names".to_string(),
        ));
    }

    Ok(())
}

fn validate_classifier_config(config: &ClassifierConfig) -> Result<(), ConfigError> {
    let unit_values = [
        ("minor-floor", config.minor_floor),
        ("content-ceiling", config.content_ceiling),
        ("structural-severity", config.structural_severity),
        ("removed-severity", config.removed_severity),
    ];
    for (name, value) in unit_values {
        validate_unit_interval(name, value)?;
    }

    if config.content_weight <= 0.0 || !config.content_weight.is_finite() {
        return Err(ConfigError::Validation(format!(
            "content-weight must be a positive number, got {}",
            config.content_weight
        )));
    }

    if config.minor_floor > config.content_ceiling {
        return Err(ConfigError::Validation(format!(
            "minor-floor ({}) cannot exceed content-ceiling ({})",
            config.minor_floor, config.content_ceiling
        )));
    }

    Ok(())
}

fn validate_notifications_config(config: &NotificationsConfig) -> Result<(), ConfigError> {
    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(
            "notifications max-attempts must be >= 1".to_string(),
        ));
    }

    if config.max_concurrent_deliveries < 1 || config.max_concurrent_deliveries > 64 {
        return Err(ConfigError::Validation(format!(
            "max-concurrent-deliveries must be between 1 and 64, got {}",
            config.max_concurrent_deliveries
        )));
    }

    if config.delivery_interval_secs < 1 || config.webhook_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "delivery-interval-secs and webhook-timeout-secs must be >= 1".to_string(),
        ));
    }

    if config.backoff_base_secs > config.backoff_max_secs {
        return Err(ConfigError::Validation(
            "backoff-base-secs cannot exceed backoff-max-secs".to_string(),
        ));
    }

    Ok(())
}

fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    if matches!(config.body_store_path.as_deref(), Some("")) {
        return Err(ConfigError::Validation(
            "body-store-path cannot be empty when set".to_string(),
        ));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    // Validate crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler-name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler-name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact-url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

fn validate_websites(websites: &[WebsiteEntry]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();

    for entry in websites {
        let root = crate::url::normalize_url(&entry.url)
            .map_err(|e| ConfigError::InvalidUrl(format!("Website '{}': {}", entry.url, e)))?;

        if !seen.insert(root.to_string()) {
            return Err(ConfigError::Validation(format!(
                "Website '{}' is configured more than once",
                entry.url
            )));
        }

        CronExpr::from_schedule(&entry.schedule).map_err(|e| {
            ConfigError::InvalidSchedule(format!("Website '{}': {}", entry.url, e))
        })?;

        if entry.max_pages < 1 {
            return Err(ConfigError::Validation(format!(
                "Website '{}': max-pages must be >= 1",
                entry.url
            )));
        }

        if entry.concurrency < 1 || entry.concurrency > 100 {
            return Err(ConfigError::Validation(format!(
                "Website '{}': concurrency must be between 1 and 100, got {}",
                entry.url, entry.concurrency
            )));
        }

        UrlScope::new(&entry.include, &entry.exclude)
            .map_err(|e| ConfigError::InvalidPattern(format!("Website '{}': {}", entry.url, e)))?;

        validate_notification_settings(&entry.url, &entry.notifications)?;
    }

    Ok(())
}

fn validate_notification_settings(
    website: &str,
    settings: &NotificationSettings,
) -> Result<(), ConfigError> {
    validate_unit_interval("min-severity", settings.min_severity)?;

    for subscription in &settings.channels {
        if subscription.target.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Website '{}': {} channel target cannot be empty",
                website, subscription.channel
            )));
        }

        match subscription.channel {
            Channel::Webhook => {
                let url = Url::parse(&subscription.target).map_err(|e| {
                    ConfigError::InvalidUrl(format!(
                        "Website '{}': webhook target '{}': {}",
                        website, subscription.target, e
                    ))
                })?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ConfigError::InvalidUrl(format!(
                        "Website '{}': webhook target must be http(s), got '{}'",
                        website, subscription.target
                    )));
                }
            }
            Channel::Email => validate_email(&subscription.target)?,
            Channel::InApp => {
                subscription.target.parse::<i64>().map_err(|_| {
                    ConfigError::Validation(format!(
                        "Website '{}': in-app target must be a user id, got '{}'",
                        website, subscription.target
                    ))
                })?;
            }
        }
    }

    Ok(())
}

fn validate_unit_interval(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Validation(format!(
            "{} must be between 0.0 and 1.0, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "email address cannot be empty".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
