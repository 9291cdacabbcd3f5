//! Notification delivery channels

use super::digest::DigestPayload;
use crate::storage::{lock_storage, SharedStorage, Storage};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Header carrying the hex HMAC-SHA256 of the request body
pub const SIGNATURE_HEADER: &str = "X-Lapis-Signature";

/// Header carrying the task kind
pub const EVENT_HEADER: &str = "X-Lapis-Event";

type HmacSha256 = Hmac<Sha256>;

/// Outcome of a failed delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Worth trying again later
    #[error("retryable delivery failure: {0}")]
    Retryable(String),

    /// Will never succeed for this target
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Delivers one digest to one target
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, target: &str, payload: &DigestPayload) -> Result<(), DeliveryError>;
}

/// POSTs the digest as JSON to the target URL
pub struct WebhookSink {
    client: Client,
    secret: Option<String>,
}

impl WebhookSink {
    pub fn new(timeout: Duration, secret: Option<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, secret))
    }

    pub fn with_client(client: Client, secret: Option<String>) -> Self {
        Self { client, secret }
    }
}

/// Hex HMAC-SHA256 of `body` keyed with `secret`
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String, DeliveryError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::Permanent(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn classify_status(status: StatusCode) -> Result<(), DeliveryError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(DeliveryError::Retryable(format!("webhook returned {}", status)))
    } else {
        Err(DeliveryError::Permanent(format!("webhook returned {}", status)))
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, target: &str, payload: &DigestPayload) -> Result<(), DeliveryError> {
        let url = url::Url::parse(target)
            .map_err(|e| DeliveryError::Permanent(format!("invalid webhook URL {}: {}", target, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DeliveryError::Permanent(format!(
                "unsupported webhook scheme: {}",
                url.scheme()
            )));
        }

        let body = serde_json::to_vec(payload)
            .map_err(|e| DeliveryError::Permanent(format!("payload serialization: {}", e)))?;

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, payload.kind.to_db_string());
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign_body(secret, &body)?);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable(format!("webhook request failed: {}", e)))?;

        debug!("Webhook {} answered {}", target, response.status());
        classify_status(response.status())
    }
}

/// Stores the digest as an in-app notification; the target is a user id
pub struct InAppSink {
    storage: SharedStorage,
}

impl InAppSink {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl NotificationSink for InAppSink {
    async fn send(&self, target: &str, payload: &DigestPayload) -> Result<(), DeliveryError> {
        let user_id: i64 = target
            .trim()
            .parse()
            .map_err(|_| DeliveryError::Permanent(format!("invalid user id: {}", target)))?;
        let data = payload
            .to_json()
            .map_err(|e| DeliveryError::Permanent(format!("payload serialization: {}", e)))?;

        let mut storage =
            lock_storage(&self.storage).map_err(|e| DeliveryError::Retryable(e.to_string()))?;
        storage
            .insert_in_app_notification(user_id, &payload.subject, &payload.message, &data, Utc::now())
            .map_err(|e| DeliveryError::Retryable(e.to_string()))?;
        Ok(())
    }
}

/// Writes the digest to the log
///
/// Stands in for email, whose transport lives outside this crate.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, target: &str, payload: &DigestPayload) -> Result<(), DeliveryError> {
        info!(
            target: "lapis_watch::notify",
            "Notification to {}: {}\n{}",
            target, payload.subject, payload.message
        );
        Ok(())
    }
}
