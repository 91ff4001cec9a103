// Browser session orchestrator - loads a credential bundle into the page
//
// The core only depends on the `Orchestrator` trait: switch the browser to
// bundle N and return once the in-page relay is ready. The shipped
// implementation treats the browser as an external launcher process; the
// actual page driving lives outside this crate.

use crate::credentials::CredentialStore;
use crate::relay::RelayChannel;
use anyhow::{bail, Result};
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

/// A potentially expensive, serialised browser operation. The rotation
/// controller guarantees at most one call is in flight.
pub trait Orchestrator: Send + Sync {
    /// Load bundle `index` and block until the relay is ready.
    fn switch_to(&self, index: u32) -> BoxFuture<'_, Result<()>>;
}

pub struct ProcessOrchestrator {
    store: Arc<CredentialStore>,
    channel: Arc<RelayChannel>,
    /// Launcher executable; None means the browser is managed externally
    executable: Option<PathBuf>,
    /// WebSocket URL handed to the launcher so the page script can find us
    relay_url: String,
    ready_timeout: Duration,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl ProcessOrchestrator {
    pub fn new(
        store: Arc<CredentialStore>,
        channel: Arc<RelayChannel>,
        executable: Option<PathBuf>,
        relay_url: String,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            store,
            channel,
            executable,
            relay_url,
            ready_timeout,
            child: tokio::sync::Mutex::new(None),
        }
    }

    /// Wait until the relay reports a live connection, polling at a short
    /// interval. Unresponsiveness past the deadline is a switch failure.
    async fn await_relay_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            if self.channel.is_connected() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "Relay did not connect within {:?} after browser switch",
                    self.ready_timeout
                );
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

impl Orchestrator for ProcessOrchestrator {
    fn switch_to(&self, index: u32) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.store.load(index).is_none() {
                bail!("Auth bundle {} is missing or invalid", index);
            }

            let mut child_slot = self.child.lock().await;

            // One browser session at a time: close the previous context
            if let Some(mut previous) = child_slot.take() {
                tracing::info!("Stopping previous browser session");
                let _ = previous.start_kill();
                let _ = previous.wait().await;
                // Let the dying session's relay socket actually close, so
                // readiness below observes the new session and not the old
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            if let Some(executable) = &self.executable {
                tracing::info!("Launching browser for auth bundle {}", index);
                let child = Command::new(executable)
                    .env("AUTH_INDEX", index.to_string())
                    .env("RELAY_WS_URL", &self.relay_url)
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        anyhow::anyhow!("Failed to launch {:?}: {}", executable, e)
                    })?;
                *child_slot = Some(child);
            } else {
                tracing::info!(
                    "No browser launcher configured; waiting for relay to attach for bundle {}",
                    index
                );
            }
            drop(child_slot);

            self.await_relay_ready().await
        })
    }
}
