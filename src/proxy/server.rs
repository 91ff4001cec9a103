//! Proxy server setup and initialization

use anyhow::{Context, Result};
use axum::{
    routing::{any, get, post},
    Router,
};
use tokio::net::TcpListener;

use super::admin;
use super::handlers::proxy_handler;
use super::state::ProxyState;

/// Start the public HTTP server.
pub async fn start_proxy(
    state: ProxyState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let bind_addr = state.config.http_addr();

    // Admin surface first (explicit routes win over the catch-all),
    // then the proxied API
    let app = Router::new()
        .route("/login", get(admin::login_page).post(admin::login))
        .route("/api/status", get(admin::status))
        .route("/api/switch-account", post(admin::switch_account))
        .route("/api/set-mode", post(admin::set_mode))
        .route("/api/toggle-reasoning", post(admin::toggle_reasoning))
        .route(
            "/api/toggle-native-reasoning",
            post(admin::toggle_native_reasoning),
        )
        .route("/api/toggle-redirect-25-30", post(admin::toggle_redirect))
        .route("/api/set-resume-config", post(admin::set_resume_config))
        // Proxy handler (catch-all)
        .route("/*path", any(proxy_handler))
        .with_state(state);

    tracing::info!("Starting proxy on {}", bind_addr);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    tracing::info!("Proxy listening on {}", bind_addr);

    // Start serving requests with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}
