//! Push notifications. Delivery is best-effort and never feeds back into
//! order or offer state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::AppError;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        recipient_token: &str,
        title: &str,
        body: &str,
        data: Value,
    ) -> Result<(), AppError>;
}

/// Writes notifications to the log instead of a push gateway.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        recipient_token: &str,
        title: &str,
        body: &str,
        data: Value,
    ) -> Result<(), AppError> {
        info!(recipient = recipient_token, title, body, %data, "notification");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub recipient_token: Option<String>,
    pub title: String,
    pub body: String,
    pub data: Value,
}

impl Notification {
    pub fn new(
        recipient_token: Option<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            recipient_token,
            title: title.into(),
            body: body.into(),
            data,
        }
    }
}

/// Fire-and-forget delivery with a small linear retry.
pub fn notify_in_background(notifier: Arc<dyn Notifier>, notification: Notification) {
    let Some(token) = notification.recipient_token.clone() else {
        debug!(title = %notification.title, "recipient has no device token; skipping notification");
        return;
    };

    tokio::spawn(async move {
        for attempt in 1..=MAX_ATTEMPTS {
            match notifier
                .notify(
                    &token,
                    &notification.title,
                    &notification.body,
                    notification.data.clone(),
                )
                .await
            {
                Ok(()) => return,
                Err(err) if attempt < MAX_ATTEMPTS => {
                    debug!(error = %err, attempt, "notification failed; retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(err) => {
                    warn!(error = %err, title = %notification.title, "notification dropped");
                }
            }
        }
    });
}
