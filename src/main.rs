// camobridge - generative-AI reverse proxy over an in-browser relay
//
// Clients see a conventional API (Google generateContent and OpenAI
// chat/completions); requests are actually serviced by a page script
// running inside an authenticated browser session, connected here over a
// WebSocket. The proxy multiplexes requests over that link, rotates
// between stored credential bundles, and translates payload dialects.
//
// Architecture:
// - Proxy server (axum): public API + admin surface
// - Relay channel (axum ws): the single live link to the page script
// - Multiplexer: per-request event queues keyed by request id
// - Rotation controller: usage/failure/manual credential switching
// - Browser orchestrator: external launcher process, interface-only here

mod browser;
mod config;
mod credentials;
mod logging;
mod proxy;
mod relay;
mod rotation;
mod translation;

use anyhow::{Context, Result};
use config::Config;
use credentials::CredentialStore;
use logging::{LogBuffer, RingBufferLayer};
use proxy::{ProxyState, RuntimeFlags};
use relay::{RelayChannel, RequestMultiplexer};
use rotation::{RotationConfig, RotationController};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    // Logs go to stdout and into the ring buffer the admin status serves.
    // Precedence: RUST_LOG env var > default "info"
    let log_buffer = LogBuffer::new();
    let default_filter = "camobridge=info,tower_http=debug,axum=debug";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(RingBufferLayer::new(log_buffer.clone()))
        .init();

    tracing::info!("camobridge {} starting", config::VERSION);

    // No credentials is fatal: the relay has nothing to log in with
    let store = Arc::new(
        CredentialStore::discover(&config.auth_dir).context("Credential discovery failed")?,
    );

    let config = Arc::new(config);
    let mux = Arc::new(RequestMultiplexer::new());
    let channel = Arc::new(RelayChannel::new(mux.clone()));

    // Relay WebSocket listener
    let ws_channel = channel.clone();
    let ws_addr = config.ws_addr();
    tokio::spawn(async move {
        if let Err(e) = ws_channel.serve(&ws_addr).await {
            tracing::error!("Relay listener failed: {:#}", e);
        }
    });

    let browser: Arc<dyn browser::Orchestrator> = Arc::new(browser::ProcessOrchestrator::new(
        store.clone(),
        channel.clone(),
        config.camoufox_executable_path.clone(),
        format!("ws://127.0.0.1:{}", config.ws_port),
        Duration::from_secs(config.browser_ready_timeout_secs),
    ));

    let rotation = Arc::new(RotationController::new(
        RotationConfig {
            switch_on_uses: config.switch_on_uses,
            failure_threshold: config.failure_threshold,
            immediate_switch_status_codes: config.immediate_switch_status_codes.clone(),
        },
        store.clone(),
        browser.clone(),
        config.initial_auth_index,
    ));

    // Load the initial bundle in the background; failure here is retried by
    // per-request auto-recovery
    let attach_rotation = rotation.clone();
    tokio::spawn(async move {
        attach_rotation.initial_attach().await;
    });

    let state = ProxyState {
        config: config.clone(),
        store,
        channel,
        mux,
        rotation,
        browser,
        flags: Arc::new(RuntimeFlags::new(config.streaming_mode)),
        log_buffer,
        admin_sessions: Arc::new(Mutex::new(HashSet::new())),
    };

    // Create shutdown channel for graceful proxy shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy::start_proxy(state, shutdown_rx).await {
            tracing::error!("Proxy server failed: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down...");

    // If the send fails, the proxy has already shut down (which is fine)
    let _ = shutdown_tx.send(());
    let _ = proxy_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
