use anyhow::{Context, Result};
use axum::http::HeaderValue;
use std::net::SocketAddr;
use std::sync::Arc;
use tokenvault::api::{create_token_router, TokenAppState};
use tokenvault::auth::ApiKeyGate;
use tokenvault::config::Config;
use tokenvault::crypto::Cipher;
use tokenvault::notify::EventNotifier;
use tokenvault::proxy::ProxyClient;
use tokenvault::refresh::TokenRefresher;
use tokenvault::store::CredentialStore;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenvault=info".into()),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    if config.api_key.is_none() {
        warn!("TOKENVAULT_API_KEY not set, privileged endpoints will reject all callers");
    }

    // Construct the shared components once and inject them into the router
    let cipher = Arc::new(Cipher::new(&config.encryption_passphrase));
    let store = Arc::new(
        CredentialStore::new(&config.db_path, cipher)
            .context("Failed to open credential store")?,
    );
    info!(db_path = %config.db_path, "Credential store ready");

    let refresher = Arc::new(TokenRefresher::new(Arc::clone(&store), config.oauth.clone()));
    let gate = ApiKeyGate::new(config.api_key.clone());
    let notifier = EventNotifier::spawn(config.webhook_url.clone(), config.api_key.clone());
    let proxy = Arc::new(ProxyClient::new(config.api_key.clone()));

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_token_router(TokenAppState {
        store,
        refresher,
        gate,
        notifier,
        proxy,
    })
    .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(%addr, "tokenvault listening");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
