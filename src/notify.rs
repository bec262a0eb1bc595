//! Outcome notifications for the party that initiated an action.
//!
//! Every mutating lifecycle or rating call reports `(success, message)` to a
//! [`Notifier`]. Delivery is advisory: a notifier never fails the operation that
//! triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::Actor;
use crate::domain::request::RequestId;
use crate::error::Result;

/// Outcome of one mutating operation, addressed to the actor who started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub actor: String,
    pub request_id: Option<RequestId>,
    pub success: bool,
    pub message: String,
}

impl Notification {
    pub fn success(actor: &Actor, request_id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self {
            actor: actor.uid().to_string(),
            request_id,
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(actor: &Actor, request_id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self {
            actor: actor.uid().to_string(),
            request_id,
            success: false,
            message: message.into(),
        }
    }
}

/// Sink for operation outcomes.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

/// Report the outcome of `result`: `success_message` on `Ok`, the error's
/// user-facing message otherwise.
pub async fn report<T>(
    notifier: &dyn Notifier,
    actor: &Actor,
    request_id: Option<RequestId>,
    success_message: &str,
    result: &Result<T>,
) {
    let notification = match result {
        Ok(_) => Notification::success(actor, request_id, success_message),
        Err(e) => Notification::failure(actor, request_id, e.user_message()),
    };
    notifier.notify(&notification).await;
}

/// Writes notifications to the log. The default notifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: &Notification) {
        if notification.success {
            tracing::debug!(
                actor = %notification.actor,
                request_id = ?notification.request_id,
                message = %notification.message,
                "Operation succeeded"
            );
        } else {
            tracing::info!(
                actor = %notification.actor,
                request_id = ?notification.request_id,
                message = %notification.message,
                "Operation failed"
            );
        }
    }
}

/// POSTs each notification as JSON to a fixed URL.
///
/// Delivery failures and non-2xx responses are logged and dropped.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    timeout_ms: u64,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout_ms: 5000,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    async fn post(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .timeout(Duration::from_millis(self.timeout_ms))
            .json(notification)
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[tracing::instrument(skip(self, notification), fields(actor = %notification.actor, url = %self.url))]
    async fn notify(&self, notification: &Notification) {
        match self.post(notification).await {
            Ok(()) => tracing::trace!("Notification delivered"),
            Err(e) => tracing::warn!(error = %e, "Failed to deliver notification"),
        }
    }
}

/// Keeps every notification in memory, for tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn last(&self) -> Option<Notification> {
        self.notifications.lock().last().cloned()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) {
        self.notifications.lock().push(notification.clone());
    }
}
