//! # parley-server
//!
//! Real-time chat coordinator.
//!
//! This binary provides:
//! - **WebSocket chat** on `/ws`: token login, a shared room with history
//!   replay, private messages with read/recall states, and per-user blocking
//! - **Durable state** in JSON documents or SQLite
//! - **REST API** (axum) for health checks and token-protected admin actions

mod api;
mod broadcast;
mod config;
mod conversations;
mod error;
mod moderation;
mod registry;
mod router;
mod session;
mod verifier;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::router::ChatRouter;
use crate::verifier::{HttpIdentityVerifier, IdentityVerifier, StaticIdentityVerifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug,parley_store=debug")),
        )
        .init();

    info!("Starting Parley chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = config
        .storage_backend
        .open(&config.data_dir)
        .with_context(|| format!("opening storage in {}", config.data_dir.display()))?;
    info!(
        backend = store.backend(),
        dir = %config.data_dir.display(),
        "Storage ready"
    );

    let verifier: Arc<dyn IdentityVerifier> = match &config.static_tokens {
        Some(list) => {
            let verifier = StaticIdentityVerifier::from_csv(list);
            info!(tokens = verifier.len(), "Using static token table");
            Arc::new(verifier)
        }
        None => {
            info!(url = %config.auth_url, "Using identity service");
            Arc::new(HttpIdentityVerifier::new(
                config.auth_url.clone(),
                config.auth_timeout,
            )?)
        }
    };

    let router = Arc::new(ChatRouter::new(store, verifier, config.filter.clone()));

    // -----------------------------------------------------------------------
    // 4. Run the chat server until Ctrl+C, then save everything once more
    // -----------------------------------------------------------------------
    let addr = config.chat_addr;
    let state = AppState::new(router.clone(), config);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    let result = api::serve(state, addr, shutdown).await;
    router.flush().await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "Chat server failed");
    }
    result
}
