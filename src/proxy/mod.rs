//! Generic egress relay.
//!
//! Forwards a JSON payload to a caller-supplied URL with the server's
//! automation credential attached, so browser clients never hold the key
//! and never fight CORS against the downstream system.

use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Timeout for the forwarded request.
const FORWARD_TIMEOUT_SECS: u64 = 30;

/// Result of a successful relay: whatever the target answered.
#[derive(Clone, Debug)]
pub struct ProxyOutcome {
    pub status: u16,
    /// Parsed JSON body when the target returned one, raw text otherwise
    pub data: Value,
}

/// Outbound relay client.
pub struct ProxyClient {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl ProxyClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
        }
    }

    /// POSTs `payload` to `target_url` and relays the response.
    ///
    /// Any upstream status is a successful relay — only transport-level
    /// failures (timeout, connection refused) are errors.
    pub async fn forward(&self, target_url: &str, payload: &Value) -> Result<ProxyOutcome, ProxyError> {
        debug!(target_url = %target_url, "Forwarding payload");

        let mut request = self
            .http
            .post(target_url)
            .timeout(Duration::from_secs(FORWARD_TIMEOUT_SECS))
            .json(payload);

        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout
            } else {
                ProxyError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))?;

        let data = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(ProxyOutcome { status, data })
    }
}

/// Relay transport failures.
#[derive(Debug, PartialEq)]
pub enum ProxyError {
    /// Target did not answer within the forward timeout
    Timeout,
    /// Connection-level failure reaching the target
    Transport(String),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Timeout => write!(f, "Target service timeout"),
            ProxyError::Transport(msg) => write!(f, "Failed to reach target: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_forward_relays_json_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("authorization", "Bearer relay-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let client = ProxyClient::new(Some("relay-key".to_string()));
        let outcome = client
            .forward(&format!("{}/hook", server.url()), &json!({"k": "v"}))
            .await
            .expect("forward failed");

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.data, json!({"ok": true}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_forward_relays_upstream_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/hook")
            .with_status(404)
            .with_body("no such workflow")
            .create_async()
            .await;

        let client = ProxyClient::new(None);
        let outcome = client
            .forward(&format!("{}/hook", server.url()), &json!({}))
            .await
            .expect("forward failed");

        // Non-2xx from the target is still a successful relay
        assert_eq!(outcome.status, 404);
        assert_eq!(outcome.data, Value::String("no such workflow".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_target_is_transport_error() {
        let client = ProxyClient::new(None);
        let err = client
            .forward("http://127.0.0.1:1/hook", &json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Transport(_)));
    }
}
