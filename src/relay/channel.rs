// Relay channel - the WebSocket link to the in-page relay script
//
// At most one connection is "primary" at a time: the first accepted live
// connection receives all outbound frames. Extra connections are tracked
// and the oldest survivor is promoted when the primary drops. When the last
// connection is lost a grace timer starts; a reconnect inside the window
// keeps in-flight requests alive, expiry closes every per-request queue.

use crate::relay::multiplexer::RequestMultiplexer;
use crate::relay::protocol::{ControlFrame, RelayEvent, RelayRequest};
use anyhow::{bail, Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// How long a reconnect may take before in-flight requests are failed
pub const RECONNECT_GRACE: Duration = Duration::from_secs(5);

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

struct Inner {
    /// Accept order; index 0 is the primary
    connections: Vec<Connection>,
    grace_timer: Option<tokio::task::JoinHandle<()>>,
    /// Bumped on every register; lets an expired timer detect it was raced
    generation: u64,
}

pub struct RelayChannel {
    mux: Arc<RequestMultiplexer>,
    inner: Mutex<Inner>,
    grace: Duration,
    next_conn_id: AtomicU64,
}

impl RelayChannel {
    pub fn new(mux: Arc<RequestMultiplexer>) -> Self {
        Self::with_grace(mux, RECONNECT_GRACE)
    }

    pub fn with_grace(mux: Arc<RequestMultiplexer>, grace: Duration) -> Self {
        Self {
            mux,
            inner: Mutex::new(Inner {
                connections: Vec::new(),
                grace_timer: None,
                generation: 0,
            }),
            grace,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.lock().unwrap().connections.is_empty()
    }

    /// Forward a request frame to the primary connection.
    pub fn send(&self, request: &RelayRequest) -> Result<()> {
        let text = serde_json::to_string(request).context("Failed to serialize relay request")?;
        self.send_text(text)
    }

    /// Best-effort cancellation notice for an abandoned request.
    pub fn send_cancel(&self, request_id: &str) {
        let frame = ControlFrame::CancelRequest {
            request_id: request_id.to_string(),
        };
        match serde_json::to_string(&frame) {
            Ok(text) => {
                if self.send_text(text).is_err() {
                    tracing::debug!("No relay connection to cancel {} on", request_id);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize cancel frame: {}", e),
        }
    }

    fn send_text(&self, text: String) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let Some(primary) = inner.connections.first() else {
            bail!("Relay is not connected");
        };
        if primary.tx.send(text).is_err() {
            bail!("Relay connection is closing");
        }
        Ok(())
    }

    /// Parse one inbound frame and route it. Frames that don't parse, or
    /// that lack a request_id, are dropped silently per protocol.
    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<RelayEvent>(text) {
            Ok(event) => self.mux.deliver(event),
            Err(_) => {
                tracing::trace!("Dropping unparseable relay frame ({} bytes)", text.len());
            }
        }
    }

    /// Track a new connection. Cancels any pending grace timer.
    pub(crate) fn register(&self, tx: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        if let Some(timer) = inner.grace_timer.take() {
            timer.abort();
            tracing::info!("Relay reconnected within grace window");
        }
        let promoted = inner.connections.is_empty();
        inner.connections.push(Connection { id, tx });
        if promoted {
            tracing::info!("Relay connection {} established (primary)", id);
        } else {
            tracing::info!(
                "Relay connection {} tracked ({} total)",
                id,
                inner.connections.len()
            );
        }
        id
    }

    /// Drop a connection; when it was the last, start the grace timer.
    fn unregister(self: &Arc<Self>, conn_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let was_primary = inner
            .connections
            .first()
            .map(|c| c.id == conn_id)
            .unwrap_or(false);
        inner.connections.retain(|c| c.id != conn_id);

        if let Some(next) = inner.connections.first() {
            if was_primary {
                tracing::info!("Relay connection {} promoted to primary", next.id);
            }
            return;
        }

        tracing::warn!(
            "Relay disconnected; grace window {:?} before failing in-flight requests",
            self.grace
        );
        let channel = self.clone();
        let generation = inner.generation;
        inner.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(channel.grace).await;
            channel.on_grace_expired(generation);
        }));
    }

    fn on_grace_expired(&self, generation: u64) {
        let mut inner = self.inner.lock().unwrap();
        // A reconnect bumps the generation; this timer is then stale
        if inner.generation != generation || !inner.connections.is_empty() {
            return;
        }
        inner.grace_timer = None;
        drop(inner);
        tracing::error!("Relay connection lost (grace expired)");
        self.mux.close_all();
    }

    /// Run the WebSocket listener. Every path upgrades.
    pub async fn serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let app = Router::new()
            .fallback(ws_handler)
            .with_state(self.clone());

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay listener on {}", addr))?;
        tracing::info!("Relay WebSocket listening on {}", addr);

        axum::serve(listener, app).await.context("Relay listener error")?;
        Ok(())
    }
}

async fn ws_handler(State(channel): State<Arc<RelayChannel>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, channel))
}

async fn handle_socket(socket: WebSocket, channel: Arc<RelayChannel>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn_id = channel.register(tx);

    // Outbound pump: frames queued by send() go to the socket
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => channel.handle_frame(&text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary/ping/pong ignored
            Err(e) => {
                tracing::debug!("Relay connection {} read error: {}", conn_id, e);
                break;
            }
        }
    }

    send_task.abort();
    channel.unregister(conn_id);
}
