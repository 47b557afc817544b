//! Best-effort webhook notifications.
//!
//! A "user authenticated" event is handed to a background worker over a
//! channel; the triggering request returns immediately. Delivery failures
//! are logged and discarded — they must never surface to the caller.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Timeout for a single webhook delivery attempt.
const DELIVERY_TIMEOUT_SECS: u64 = 30;

/// Event posted to the workflow webhook after a token submission.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthEvent {
    pub user_id: String,
    pub email: String,
    pub event: &'static str,
}

impl AuthEvent {
    pub fn user_authenticated(user_id: &str, email: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            email: email.to_string(),
            event: "user_authenticated",
        }
    }
}

/// Handle for enqueuing notification events.
///
/// Cheap to clone. Constructed disabled when no webhook URL is configured;
/// a disabled notifier drops events silently.
#[derive(Clone)]
pub struct EventNotifier {
    tx: Option<mpsc::UnboundedSender<AuthEvent>>,
}

impl EventNotifier {
    /// Spawns the delivery worker and returns the enqueue handle.
    ///
    /// `api_key` is attached as a bearer credential on each delivery when
    /// present. With `webhook_url: None` no worker is spawned and the
    /// returned notifier is a no-op.
    pub fn spawn(webhook_url: Option<String>, api_key: Option<String>) -> Self {
        let Some(url) = webhook_url else {
            debug!("No webhook URL configured, notifications disabled");
            return Self { tx: None };
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver_events(rx, url, api_key));

        Self { tx: Some(tx) }
    }

    /// A notifier that drops everything. For wiring up tests.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Enqueues an event for delivery and returns immediately.
    ///
    /// Failures (notifier disabled, worker gone) are absorbed here — the
    /// store write is the durability boundary, not the webhook.
    pub fn notify(&self, event: AuthEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        if tx.send(event).is_err() {
            warn!("Notification worker is gone, dropping event");
        }
    }
}

/// Delivery loop: drain the channel, POST each event, discard failures.
async fn deliver_events(
    mut rx: mpsc::UnboundedReceiver<AuthEvent>,
    webhook_url: String,
    api_key: Option<String>,
) {
    let client = reqwest::Client::new();

    info!(webhook_url = %webhook_url, "Notification worker started");

    while let Some(event) = rx.recv().await {
        let mut request = client
            .post(&webhook_url)
            .timeout(Duration::from_secs(DELIVERY_TIMEOUT_SECS))
            .json(&event);

        if let Some(key) = &api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(user_id = %event.user_id, "Webhook delivered");
            }
            Ok(response) => {
                warn!(
                    user_id = %event.user_id,
                    status = %response.status(),
                    "Webhook rejected, discarding event"
                );
            }
            Err(e) => {
                warn!(
                    user_id = %event.user_id,
                    error = %e,
                    "Webhook delivery failed, discarding event"
                );
            }
        }
    }
}
