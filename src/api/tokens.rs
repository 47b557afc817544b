//! Token custody API endpoints.
//!
//! Wire format is camelCase JSON, matching the frontend contract. The
//! privileged routes (get-token, users, refresh-token) pass through the
//! access gate; store-token and validate-token are called by the end-user's
//! own authenticated frontend session and are not gated here.

use crate::auth::{ApiKeyGate, GateError};
use crate::notify::{AuthEvent, EventNotifier};
use crate::proxy::{ProxyClient, ProxyError};
use crate::refresh::{RefreshError, TokenRefresher};
use crate::store::{Credential, CredentialProfile, CredentialStore, StoreError, TokenSubmission};
use crate::validity::check_validity;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state for the token API
#[derive(Clone)]
pub struct TokenAppState {
    pub store: Arc<CredentialStore>,
    pub refresher: Arc<TokenRefresher>,
    pub gate: ApiKeyGate,
    pub notifier: EventNotifier,
    pub proxy: Arc<ProxyClient>,
}

/// Request body for POST /api/auth/store-token
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreTokenRequest {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Generic acknowledgement response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub success: bool,
    pub message: String,
    pub user_id: String,
}

/// Full credential with decrypted secrets (privileged responses only)
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTokenResponse {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl From<Credential> for UserTokenResponse {
    fn from(c: Credential) -> Self {
        Self {
            user_id: c.user_id,
            email: c.email,
            display_name: c.display_name,
            photo_url: c.photo_url,
            access_token: c.access_token,
            refresh_token: c.refresh_token,
            expires_at: c.expires_at,
            scopes: c.scopes,
        }
    }
}

/// Request body for POST /api/auth/validate-token
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenRequest {
    pub user_id: String,
}

/// Response for POST /api/auth/validate-token. Never carries secrets.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Profile record for GET /api/auth/users
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfileResponse {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub scopes: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<CredentialProfile> for UserProfileResponse {
    fn from(p: CredentialProfile) -> Self {
        Self {
            user_id: p.user_id,
            email: p.email,
            display_name: p.display_name,
            photo_url: p.photo_url,
            scopes: p.scopes,
            updated_at: p.updated_at,
        }
    }
}

/// Response for GET /api/auth/users
#[derive(Serialize)]
pub struct ListUsersResponse {
    pub users: Vec<UserProfileResponse>,
    pub count: usize,
}

/// Request body for POST /api/auth/refresh-token.
///
/// Accepts both spellings of the user id, matching what existing
/// automation workflows send.
#[derive(Deserialize)]
pub struct RefreshTokenRequest {
    #[serde(default, rename = "userId")]
    pub user_id: Option<String>,
    #[serde(default, rename = "user_id")]
    pub user_id_snake: Option<String>,
}

/// Request body for POST /api/proxy
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub target_url: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Response for POST /api/proxy
#[derive(Serialize)]
pub struct ProxyResponse {
    pub success: bool,
    pub status: u16,
    pub data: Value,
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

/// Create the token API router
pub fn create_token_router(state: TokenAppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/auth/store-token", post(store_token))
        .route("/api/auth/get-token/:user_id", get(get_token))
        .route("/api/auth/validate-token", post(validate_token))
        .route("/api/auth/users", get(list_users))
        .route("/api/auth/refresh-token", post(refresh_token))
        .route("/api/proxy", post(proxy_forward))
        .with_state(Arc::new(state))
}

/// GET / - Health probe
async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "message": "tokenvault is running",
        "status": "healthy"
    }))
}

/// POST /api/auth/store-token - Persist a user's OAuth tokens
///
/// Upserts with field-level merge: an omitted refresh token never erases a
/// stored one. Fires the authenticated-user webhook best-effort.
async fn store_token(
    State(state): State<Arc<TokenAppState>>,
    Json(body): Json<StoreTokenRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    if body.user_id.is_empty() {
        return Err(AppError::Validation("Field 'userId' is required".to_string()));
    }

    let submission = TokenSubmission {
        user_id: body.user_id.clone(),
        email: body.email.clone(),
        display_name: body.display_name,
        photo_url: body.photo_url,
        access_token: body.access_token,
        refresh_token: body.refresh_token,
        expires_at: body.expires_at,
        scopes: body.scopes,
    };

    state.store.upsert(&submission)?;

    info!(user_id = %body.user_id, "Token stored");

    // Best-effort: delivery runs on the worker, failure never reaches here
    state
        .notifier
        .notify(AuthEvent::user_authenticated(&body.user_id, &body.email));

    Ok(Json(TokenResponse {
        success: true,
        message: "Token stored successfully".to_string(),
        user_id: body.user_id,
    }))
}

/// GET /api/auth/get-token/:user_id - Fetch a credential with decrypted
/// secrets (requires the automation API key)
async fn get_token(
    State(state): State<Arc<TokenAppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<UserTokenResponse>, AppError> {
    state.gate.authorize(&headers)?;

    let credential = state
        .store
        .get(&user_id)?
        .ok_or_else(|| AppError::NotFound("User token not found".to_string()))?;

    Ok(Json(credential.into()))
}

/// POST /api/auth/validate-token - Check whether a stored credential is
/// currently usable. Returns no secrets and requires no authorization.
async fn validate_token(
    State(state): State<Arc<TokenAppState>>,
    Json(body): Json<ValidateTokenRequest>,
) -> Result<Json<ValidateTokenResponse>, AppError> {
    let status = state.store.status(&body.user_id)?;
    let validity = check_validity(status.as_ref(), Utc::now());

    let response = match status {
        Some(status) if validity.is_valid() => ValidateTokenResponse {
            valid: true,
            reason: None,
            email: Some(status.email),
            display_name: Some(status.display_name),
        },
        _ => ValidateTokenResponse {
            valid: false,
            reason: validity.reason(),
            email: None,
            display_name: None,
        },
    };

    Ok(Json(response))
}

/// GET /api/auth/users - List stored credential profiles, without secrets
/// (requires the automation API key)
async fn list_users(
    State(state): State<Arc<TokenAppState>>,
    headers: HeaderMap,
) -> Result<Json<ListUsersResponse>, AppError> {
    state.gate.authorize(&headers)?;

    let users: Vec<UserProfileResponse> = state
        .store
        .list_all()?
        .into_iter()
        .map(Into::into)
        .collect();
    let count = users.len();

    Ok(Json(ListUsersResponse { users, count }))
}

/// POST /api/auth/refresh-token - Run the refresh orchestrator for a user
/// (requires the automation API key)
async fn refresh_token(
    State(state): State<Arc<TokenAppState>>,
    headers: HeaderMap,
    Json(body): Json<RefreshTokenRequest>,
) -> Result<Json<UserTokenResponse>, AppError> {
    state.gate.authorize(&headers)?;

    let user_id = body
        .user_id
        .or(body.user_id_snake)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            AppError::Validation("Field 'userId' or 'user_id' is required".to_string())
        })?;

    let credential = state.refresher.refresh(&user_id).await?;

    Ok(Json(credential.into()))
}

/// POST /api/proxy - Forward a payload to an external URL with the server's
/// automation credential attached
async fn proxy_forward(
    State(state): State<Arc<TokenAppState>>,
    Json(body): Json<ProxyRequest>,
) -> Result<Json<ProxyResponse>, AppError> {
    if body.target_url.is_empty() {
        return Err(AppError::Validation("Field 'targetUrl' is required".to_string()));
    }

    let payload = body.payload.unwrap_or_else(|| Value::Object(Default::default()));
    let outcome = state.proxy.forward(&body.target_url, &payload).await?;

    Ok(Json(ProxyResponse {
        success: true,
        status: outcome.status,
        data: outcome.data,
    }))
}

/// Application error types
pub enum AppError {
    Validation(String),
    Unauthorized(String),
    NotFound(String),
    /// Provider permanently rejected the refresh secret; the caller should
    /// send the user back through consent instead of retrying
    ReauthRequired,
    Upstream { status: u16, body: String },
    BadGateway(String),
    GatewayTimeout,
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, code) = match self {
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg, None),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::ReauthRequired => (
                StatusCode::UNAUTHORIZED,
                "Invalid refresh token. User must re-authenticate.".to_string(),
                Some("reauth_required"),
            ),
            AppError::Upstream { status, body } => (
                StatusCode::BAD_GATEWAY,
                format!("Provider error (status {}): {}", status, body),
                None,
            ),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg, None),
            AppError::GatewayTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "Target service timeout".to_string(),
                None,
            ),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };

        (status, Json(ErrorResponse { error, code })).into_response()
    }
}

impl From<GateError> for AppError {
    fn from(e: GateError) -> Self {
        AppError::Unauthorized(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        warn!(error = %e, "Store operation failed");
        AppError::Internal(e.to_string())
    }
}

impl From<RefreshError> for AppError {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::NotConfigured => {
                AppError::Internal("Server not configured for OAuth refresh".to_string())
            }
            RefreshError::NotFound => {
                AppError::NotFound("Refresh token not found for user".to_string())
            }
            RefreshError::ReauthRequired => AppError::ReauthRequired,
            RefreshError::Upstream { status, body } => AppError::Upstream { status, body },
            RefreshError::Transport(msg) => AppError::BadGateway(msg),
            RefreshError::Crypto(e) => {
                warn!(error = %e, "Decrypt failure during refresh");
                AppError::Internal(e.to_string())
            }
            RefreshError::Store(e) => {
                warn!(error = %e, "Store failure during refresh");
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl From<ProxyError> for AppError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Timeout => AppError::GatewayTimeout,
            ProxyError::Transport(msg) => {
                AppError::BadGateway(format!("Failed to reach target: {}", msg))
            }
        }
    }
}
