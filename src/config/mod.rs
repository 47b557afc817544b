//! Environment-driven configuration.
//!
//! Loaded once at startup and handed to the components that need it; no
//! module-level globals. All knobs come from `TOKENVAULT_*` environment
//! variables.

use anyhow::{Context, Result};

/// Default token endpoint for the upstream OAuth provider.
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Complete service configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path to the SQLite credential database
    pub db_path: String,
    /// Passphrase the token cipher key is derived from (required)
    pub encryption_passphrase: String,
    /// Shared key for the automation caller. Used as the access-gate
    /// secret and as the bearer credential on webhook/proxy egress.
    /// Unset means the privileged endpoints reject everything.
    pub api_key: Option<String>,
    /// Upstream OAuth provider settings
    pub oauth: OAuthConfig,
    /// Webhook URL for user-authenticated events; unset disables them
    pub webhook_url: Option<String>,
    /// Browser origins allowed by CORS
    pub allowed_origins: Vec<String>,
    /// HTTP listening port
    pub port: u16,
}

/// OAuth client settings for the refresh-token grant.
#[derive(Clone, Debug)]
pub struct OAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: String,
    /// Redirect target used by the upstream authorization flow; carried
    /// here so one environment configures both halves of the deployment.
    pub redirect_uri: Option<String>,
}

impl Config {
    /// Loads configuration from the environment.
    ///
    /// Only the encryption passphrase is hard-required; everything else
    /// has a default or degrades a single feature when absent.
    pub fn from_env() -> Result<Self> {
        let encryption_passphrase = std::env::var("TOKENVAULT_ENCRYPTION_PASSPHRASE")
            .context("TOKENVAULT_ENCRYPTION_PASSPHRASE must be set")?;

        let port = match std::env::var("TOKENVAULT_PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("Invalid TOKENVAULT_PORT '{}'", raw))?,
            Err(_) => 8011,
        };

        let allowed_origins = std::env::var("TOKENVAULT_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            db_path: std::env::var("TOKENVAULT_DB_PATH")
                .unwrap_or_else(|_| "tokenvault.db".to_string()),
            encryption_passphrase,
            api_key: std::env::var("TOKENVAULT_API_KEY").ok(),
            oauth: OAuthConfig {
                client_id: std::env::var("TOKENVAULT_OAUTH_CLIENT_ID").ok(),
                client_secret: std::env::var("TOKENVAULT_OAUTH_CLIENT_SECRET").ok(),
                token_url: std::env::var("TOKENVAULT_OAUTH_TOKEN_URL")
                    .unwrap_or_else(|_| DEFAULT_TOKEN_URL.to_string()),
                redirect_uri: std::env::var("TOKENVAULT_OAUTH_REDIRECT_URI").ok(),
            },
            webhook_url: std::env::var("TOKENVAULT_WEBHOOK_URL").ok(),
            allowed_origins,
            port,
        })
    }
}
