//! OAuth refresh-token grant orchestration.
//!
//! Exchanges a stored refresh secret for a new access secret at the
//! provider's token endpoint and persists the result. Provider failures are
//! classified: a permanent `invalid_grant` rejection invalidates the stored
//! credential and surfaces as [`RefreshError::ReauthRequired`], everything
//! else is transient and left for the caller to retry.

use crate::config::OAuthConfig;
use crate::crypto::CryptoError;
use crate::store::{Credential, CredentialStore, StoreError};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Timeout for the provider token-endpoint round trip.
const PROVIDER_TIMEOUT_SECS: u64 = 30;

/// Token response from the OAuth token refresh endpoint.
///
/// `access_token` is optional here so a 200 response without one can be
/// reported as an upstream fault instead of a parse error.
#[derive(Deserialize)]
struct TokenGrant {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Error body shape for non-success provider responses.
#[derive(Deserialize)]
struct ProviderError {
    #[serde(default)]
    error: Option<String>,
}

/// Refresh orchestrator.
///
/// Holds the shared store, the OAuth client settings, and one HTTP client.
/// Refreshes for the same user are serialized by a per-user async lock held
/// across the provider exchange; distinct users proceed concurrently.
pub struct TokenRefresher {
    store: Arc<CredentialStore>,
    oauth: OAuthConfig,
    http: reqwest::Client,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenRefresher {
    pub fn new(store: Arc<CredentialStore>, oauth: OAuthConfig) -> Self {
        Self {
            store,
            oauth,
            http: reqwest::Client::new(),
            locks: DashMap::new(),
        }
    }

    /// Exchanges the stored refresh secret for fresh tokens.
    ///
    /// On success the store holds the re-encrypted secrets and the returned
    /// [`Credential`] carries them in plaintext for the privileged caller.
    /// The store is never mutated on transient failures.
    pub async fn refresh(&self, user_id: &str) -> Result<Credential, RefreshError> {
        let (Some(client_id), Some(client_secret)) =
            (self.oauth.client_id.clone(), self.oauth.client_secret.clone())
        else {
            return Err(RefreshError::NotConfigured);
        };

        // One in-flight provider exchange per user
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let credential = self
            .store
            .get(user_id)?
            .ok_or(RefreshError::NotFound)?;
        let refresh_token = credential
            .refresh_token
            .clone()
            .ok_or(RefreshError::NotFound)?;

        let mut form: HashMap<&str, &str> = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", &refresh_token);
        form.insert("client_id", &client_id);
        form.insert("client_secret", &client_secret);

        info!(user_id = %user_id, "Refreshing OAuth access token");

        let response = self
            .http
            .post(&self.oauth.token_url)
            .header("Accept", "application/json")
            .timeout(std::time::Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        if !status.is_success() {
            // invalid_grant means the refresh token is permanently dead:
            // clear the stored secrets so the user is forced to re-consent
            let provider_error: Option<ProviderError> = serde_json::from_str(&body).ok();
            if provider_error.and_then(|e| e.error).as_deref() == Some("invalid_grant") {
                warn!(user_id = %user_id, "Refresh token rejected by provider, invalidating credential");
                self.store.invalidate(user_id)?;
                return Err(RefreshError::ReauthRequired);
            }

            return Err(RefreshError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let grant: TokenGrant = serde_json::from_str(&body).map_err(|e| RefreshError::Upstream {
            status: status.as_u16(),
            body: format!("malformed token response: {}", e),
        })?;

        let Some(access_token) = grant.access_token else {
            return Err(RefreshError::Upstream {
                status: status.as_u16(),
                body: "no access token returned".to_string(),
            });
        };

        let expires_at = grant
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));

        // Providers often omit the refresh token when it is unrotated;
        // the prior plaintext is re-encrypted and kept valid
        let new_refresh_token = grant.refresh_token.unwrap_or(refresh_token);

        self.store
            .update_tokens(user_id, &access_token, &new_refresh_token, expires_at)?;

        info!(user_id = %user_id, "OAuth access token refreshed");

        Ok(Credential {
            access_token: Some(access_token),
            refresh_token: Some(new_refresh_token),
            expires_at,
            updated_at: Utc::now(),
            ..credential
        })
    }
}

/// Refresh failure classification.
///
/// `ReauthRequired` is deliberately distinct from every other variant so a
/// consuming workflow can prompt re-consent instead of retrying.
#[derive(Debug)]
pub enum RefreshError {
    /// OAuth client id/secret not configured server-side
    NotConfigured,
    /// No stored credential, or no refresh secret on it
    NotFound,
    /// Provider permanently rejected the refresh secret; credential cleared
    ReauthRequired,
    /// Provider returned an unexpected status or malformed body
    Upstream { status: u16, body: String },
    /// Network failure reaching the provider
    Transport(String),
    /// Decrypt failure on a stored secret
    Crypto(CryptoError),
    /// Store read/write failure
    Store(StoreError),
}

impl From<StoreError> for RefreshError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Crypto(e) => RefreshError::Crypto(e),
            other => RefreshError::Store(other),
        }
    }
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshError::NotConfigured => write!(f, "Server not configured for OAuth refresh"),
            RefreshError::NotFound => write!(f, "No refresh token stored for user"),
            RefreshError::ReauthRequired => {
                write!(f, "Refresh token rejected; user must re-authenticate")
            }
            RefreshError::Upstream { status, body } => {
                write!(f, "Provider error (status {}): {}", status, body)
            }
            RefreshError::Transport(msg) => write!(f, "Failed to reach provider: {}", msg),
            RefreshError::Crypto(e) => write!(f, "{}", e),
            RefreshError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RefreshError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Cipher;
    use crate::store::TokenSubmission;

    fn make_store() -> Arc<CredentialStore> {
        let cipher = Arc::new(Cipher::new("test-passphrase"));
        Arc::new(CredentialStore::new(":memory:", cipher).expect("Failed to create test store"))
    }

    fn make_refresher(store: Arc<CredentialStore>, token_url: &str) -> TokenRefresher {
        TokenRefresher::new(
            store,
            OAuthConfig {
                client_id: Some("client-id".to_string()),
                client_secret: Some("client-secret".to_string()),
                token_url: token_url.to_string(),
                redirect_uri: None,
            },
        )
    }

    fn seed(store: &CredentialStore, user_id: &str, refresh_token: Option<&str>) {
        store
            .upsert(&TokenSubmission {
                user_id: user_id.to_string(),
                email: "user@example.com".to_string(),
                display_name: "User".to_string(),
                photo_url: None,
                access_token: "old-access".to_string(),
                refresh_token: refresh_token.map(str::to_string),
                expires_at: Some(Utc::now() - Duration::minutes(5)),
                scopes: vec!["email".to_string()],
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_success_preserves_unrotated_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new-access","expires_in":3600}"#)
            .create_async()
            .await;

        let store = make_store();
        seed(&store, "u1", Some("my-refresh"));
        let refresher = make_refresher(Arc::clone(&store), &format!("{}/token", server.url()));

        let credential = refresher.refresh("u1").await.expect("refresh failed");

        assert_eq!(credential.access_token.as_deref(), Some("new-access"));
        // Provider did not rotate; the prior refresh token must be kept
        assert_eq!(credential.refresh_token.as_deref(), Some("my-refresh"));

        let expires_at = credential.expires_at.expect("expires_at missing");
        let delta = (expires_at - (Utc::now() + Duration::seconds(3600)))
            .num_seconds()
            .abs();
        assert!(delta < 5, "expires_at off by {}s", delta);

        // Persisted form matches what was returned
        let stored = store.get("u1").unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("new-access"));
        assert_eq!(stored.refresh_token.as_deref(), Some("my-refresh"));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_success_adopts_rotated_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(
                r#"{"access_token":"new-access","refresh_token":"rotated","expires_in":1800}"#,
            )
            .create_async()
            .await;

        let store = make_store();
        seed(&store, "u1", Some("my-refresh"));
        let refresher = make_refresher(Arc::clone(&store), &format!("{}/token", server.url()));

        let credential = refresher.refresh("u1").await.unwrap();
        assert_eq!(credential.refresh_token.as_deref(), Some("rotated"));

        let stored = store.get("u1").unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn test_invalid_grant_invalidates_credential() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"Token has been revoked"}"#)
            .create_async()
            .await;

        let store = make_store();
        seed(&store, "u1", Some("revoked-refresh"));
        let refresher = make_refresher(Arc::clone(&store), &format!("{}/token", server.url()));

        let err = refresher.refresh("u1").await.unwrap_err();
        assert!(matches!(err, RefreshError::ReauthRequired));

        // All secrets and the expiry are gone; the user must re-consent
        let stored = store.get("u1").unwrap().unwrap();
        assert!(stored.access_token.is_none());
        assert!(stored.refresh_token.is_none());
        assert!(stored.expires_at.is_none());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transient_provider_error_leaves_store_untouched() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let store = make_store();
        seed(&store, "u1", Some("my-refresh"));
        let refresher = make_refresher(Arc::clone(&store), &format!("{}/token", server.url()));

        let err = refresher.refresh("u1").await.unwrap_err();
        match err {
            RefreshError::Upstream { status, body } => {
                assert_eq!(status, 503);
                assert!(body.contains("unavailable"));
            }
            other => panic!("expected Upstream, got {:?}", other),
        }

        let stored = store.get("u1").unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("old-access"));
        assert_eq!(stored.refresh_token.as_deref(), Some("my-refresh"));
    }

    #[tokio::test]
    async fn test_ok_response_without_access_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"expires_in":3600}"#)
            .create_async()
            .await;

        let store = make_store();
        seed(&store, "u1", Some("my-refresh"));
        let refresher = make_refresher(Arc::clone(&store), &format!("{}/token", server.url()));

        let err = refresher.refresh("u1").await.unwrap_err();
        match err {
            RefreshError::Upstream { status, body } => {
                assert_eq!(status, 200);
                assert!(body.contains("no access token"));
            }
            other => panic!("expected Upstream, got {:?}", other),
        }

        // No mutation on the missing-token edge case
        let stored = store.get("u1").unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("old-access"));
    }

    #[tokio::test]
    async fn test_unknown_user_not_found() {
        let store = make_store();
        let refresher = make_refresher(store, "http://localhost:1/token");

        let err = refresher.refresh("nobody").await.unwrap_err();
        assert!(matches!(err, RefreshError::NotFound));
    }

    #[tokio::test]
    async fn test_missing_refresh_token_not_found() {
        let store = make_store();
        seed(&store, "u1", None);
        let refresher = make_refresher(store, "http://localhost:1/token");

        let err = refresher.refresh("u1").await.unwrap_err();
        assert!(matches!(err, RefreshError::NotFound));
    }

    #[tokio::test]
    async fn test_unconfigured_client_rejected_before_lookup() {
        let store = make_store();
        let refresher = TokenRefresher::new(
            store,
            OAuthConfig {
                client_id: None,
                client_secret: None,
                token_url: "http://localhost:1/token".to_string(),
                redirect_uri: None,
            },
        );

        let err = refresher.refresh("u1").await.unwrap_err();
        assert!(matches!(err, RefreshError::NotConfigured));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_transport_error() {
        let store = make_store();
        seed(&store, "u1", Some("my-refresh"));
        // Nothing listens on port 1
        let refresher = make_refresher(store, "http://127.0.0.1:1/token");

        let err = refresher.refresh("u1").await.unwrap_err();
        assert!(matches!(err, RefreshError::Transport(_)));
    }
}
