//! Change notifications
//!
//! - [`NotificationDispatcher`]: queues one digest per run and subscription,
//!   then delivers due tasks with retry and backoff
//! - [`NotificationSink`]: a delivery channel (webhook, in-app, log)
//! - [`DigestPayload`]: the JSON document every sink receives

mod digest;
mod dispatcher;
mod sink;

pub use digest::{ChangeSummary, DigestPayload};
pub use dispatcher::{DeliveryReport, NotificationDispatcher};
pub use sink::{
    sign_body, DeliveryError, InAppSink, LogSink, NotificationSink, WebhookSink, EVENT_HEADER,
    SIGNATURE_HEADER,
};
