//! Request and response handlers for the proxy
//!
//! `proxy_handler` is the catch-all entry point; the streaming and buffered
//! submodules drive the three response modes against the relay queue.

mod buffered;
mod request;
mod streaming;

pub use request::proxy_handler;

use crate::relay::{RelayChannel, RequestMultiplexer};
use crate::rotation::RotationController;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Default dequeue deadline while waiting for response headers
pub(super) const GENERAL_TIMEOUT: Duration = Duration::from_secs(600);
/// Inter-chunk deadline for real streams
pub(super) const INTER_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);
/// Whole-body deadline for buffered waits
pub(super) const WHOLE_BODY_TIMEOUT: Duration = Duration::from_secs(300);
/// Deadline for the models listing aggregation
pub(super) const MODELS_TIMEOUT: Duration = Duration::from_secs(60);
/// Pseudo-stream keep-alive cadence
pub(super) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// Fresh relay request id: `<epoch-ms>_<9-char-alnum>`.
pub(super) fn mint_request_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// How the relay's response is post-processed before the client sees it.
pub(super) enum ResponseKind {
    /// Google surface: bytes pass through (buffered bodies get the inline
    /// image rewrite)
    Google,
    /// OpenAI surface: chunks and bodies are translated back
    OpenAiChat { model: String },
    /// `/v1/models` aggregation
    ModelsList,
}

/// Ensures per-request cleanup happens exactly once on every exit path.
///
/// `complete()` is the clean path: the upstream exchange reached a terminal
/// state and the queue/active-count are released. Dropping the guard
/// without completing means the request was abandoned (client disconnect,
/// deadline) and a best-effort `cancel_request` goes to the relay first.
pub(super) struct RequestGuard {
    request_id: String,
    rotation: Arc<RotationController>,
    mux: Arc<RequestMultiplexer>,
    channel: Arc<RelayChannel>,
    finished: bool,
}

impl RequestGuard {
    pub(super) fn new(
        request_id: String,
        rotation: Arc<RotationController>,
        mux: Arc<RequestMultiplexer>,
        channel: Arc<RelayChannel>,
    ) -> Self {
        Self {
            request_id,
            rotation,
            mux,
            channel,
            finished: false,
        }
    }

    pub(super) fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Clean finalisation: no cancellation is sent.
    pub(super) fn complete(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, cancelled: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        if cancelled {
            self.channel.send_cancel(&self.request_id);
        }
        self.mux.remove_queue(&self.request_id);
        self.rotation.finalize();
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.finish(true);
    }
}

/// One SSE error frame, written when the status line is already committed.
pub(super) fn sse_error_frame(status: Option<u16>, message: &str) -> String {
    let payload = serde_json::json!({
        "error": {
            "code": status,
            "message": message,
        }
    });
    format!("data: {}\n\n", payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::Orchestrator;
    use crate::config::{Config, StreamingMode};
    use crate::credentials::CredentialStore;
    use crate::logging::LogBuffer;
    use crate::proxy::state::{ProxyState, RuntimeFlags};
    use crate::relay::{RelayEvent, RequestMultiplexer};
    use crate::rotation::RotationConfig;
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::Request;
    use futures::future::BoxFuture;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[test]
    fn test_request_id_shape() {
        let id = mint_request_id();
        let (millis, suffix) = id.split_once('_').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(mint_request_id(), mint_request_id());
    }

    #[test]
    fn test_sse_error_frame_shape() {
        let frame = sse_error_frame(Some(500), "boom");
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        let payload: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(payload["error"]["code"], 500);
        assert_eq!(payload["error"]["message"], "boom");
    }

    // ────────────────────────────────────────────────────────────────────
    // Pipeline scenarios, driven through proxy_handler with a scripted
    // relay peer (frames read from the channel, events injected into the
    // multiplexer)
    // ────────────────────────────────────────────────────────────────────

    struct NoopBrowser;

    impl Orchestrator for NoopBrowser {
        fn switch_to(&self, _index: u32) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn test_state(mode: StreamingMode, max_retries: u32) -> ProxyState {
        let config = Arc::new(Config {
            max_retries,
            retry_delay_ms: 0,
            ..Config::default()
        });
        let store = Arc::new(CredentialStore::for_tests(vec![1, 2]));
        let mux = Arc::new(RequestMultiplexer::new());
        let channel = Arc::new(RelayChannel::new(mux.clone()));
        let browser: Arc<dyn Orchestrator> = Arc::new(NoopBrowser);
        let rotation = Arc::new(crate::rotation::RotationController::new(
            RotationConfig {
                switch_on_uses: config.switch_on_uses,
                failure_threshold: config.failure_threshold,
                immediate_switch_status_codes: config.immediate_switch_status_codes.clone(),
            },
            store.clone(),
            browser.clone(),
            1,
        ));
        ProxyState {
            config,
            store,
            channel,
            mux,
            rotation,
            browser,
            flags: Arc::new(RuntimeFlags::new(mode)),
            log_buffer: LogBuffer::new(),
            admin_sessions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Connect a scripted relay peer; returns the frames it will receive.
    fn attach_relay(state: &ProxyState) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.channel.register(tx);
        rx
    }

    fn request_id_of(frame: &str) -> String {
        let parsed: serde_json::Value = serde_json::from_str(frame).unwrap();
        parsed["request_id"].as_str().unwrap().to_string()
    }

    async fn body_text(body: Body) -> String {
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_real_stream_happy_path() {
        let state = test_state(StreamingMode::Real, 1);
        let mut relay_rx = attach_relay(&state);

        let mux = state.mux.clone();
        tokio::spawn(async move {
            let frame = relay_rx.recv().await.unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(parsed["streaming_mode"], "real");
            assert_eq!(parsed["is_generative"], true);
            let id = parsed["request_id"].as_str().unwrap().to_string();

            let mut headers = HashMap::new();
            headers.insert("content-length".to_string(), "999".to_string());
            headers.insert("x-upstream".to_string(), "yes".to_string());
            mux.deliver(RelayEvent::ResponseHeaders {
                request_id: id.clone(),
                status: 200,
                headers,
            });
            for i in 0..3 {
                mux.deliver(RelayEvent::Chunk {
                    request_id: id.clone(),
                    data: format!("data: {{\"n\":{}}}\n\n", i),
                });
            }
            mux.deliver(RelayEvent::StreamClose { request_id: id });
        });

        let req = Request::builder()
            .method("POST")
            .uri("/v1beta/models/gemini-pro:streamGenerateContent")
            .header("x-api-key", "123456")
            .body(Body::from("{}"))
            .unwrap();
        let resp = proxy_handler(State(state.clone()), req).await;

        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert!(resp.headers().get("content-length").is_none());
        assert_eq!(resp.headers().get("x-upstream").unwrap(), "yes");

        let text = body_text(resp.into_body()).await;
        assert_eq!(
            text,
            "data: {\"n\":0}\n\ndata: {\"n\":1}\n\ndata: {\"n\":2}\n\n"
        );

        let snap = state.rotation.snapshot();
        assert_eq!(snap.usage_count, 1);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.active_requests, 0);
        assert_eq!(state.mux.len(), 0);
    }

    #[tokio::test]
    async fn test_pseudo_stream_retries_once_then_succeeds() {
        let state = test_state(StreamingMode::Fake, 1);
        let mut relay_rx = attach_relay(&state);

        let mux = state.mux.clone();
        tokio::spawn(async move {
            let frame = relay_rx.recv().await.unwrap();
            let id = request_id_of(&frame);
            mux.deliver(RelayEvent::Error {
                request_id: id,
                status: Some(500),
                message: "x".to_string(),
            });

            // The retry reuses the request id
            let frame = relay_rx.recv().await.unwrap();
            let id = request_id_of(&frame);
            mux.deliver(RelayEvent::ResponseHeaders {
                request_id: id.clone(),
                status: 200,
                headers: HashMap::new(),
            });
            mux.deliver(RelayEvent::Chunk {
                request_id: id.clone(),
                data: "{\"candidates\":[]}".to_string(),
            });
            mux.deliver(RelayEvent::StreamClose { request_id: id });
        });

        let req = Request::builder()
            .method("POST")
            .uri("/v1beta/models/gemini-pro:streamGenerateContent")
            .header("x-api-key", "123456")
            .body(Body::from("{}"))
            .unwrap();
        let resp = proxy_handler(State(state.clone()), req).await;

        assert_eq!(resp.status(), 200);
        let text = body_text(resp.into_body()).await;
        assert!(text.contains("data: {\"candidates\":[]}\n\n"));
        assert!(text.ends_with("data: [DONE]\n\n"));

        // Success after the failure resets the streak
        let snap = state.rotation.snapshot();
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.active_requests, 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_sends_one_cancel() {
        let state = test_state(StreamingMode::Real, 1);
        let mut relay_rx = attach_relay(&state);

        let frame = {
            let mux = state.mux.clone();
            let req = Request::builder()
                .method("POST")
                .uri("/v1beta/models/gemini-pro:streamGenerateContent")
                .header("x-api-key", "123456")
                .body(Body::from("{}"))
                .unwrap();

            let handler = tokio::spawn(proxy_handler(State(state.clone()), req));

            let frame = tokio::time::timeout(Duration::from_secs(2), relay_rx.recv())
                .await
                .unwrap()
                .unwrap();
            let id = request_id_of(&frame);
            mux.deliver(RelayEvent::ResponseHeaders {
                request_id: id.clone(),
                status: 200,
                headers: HashMap::new(),
            });

            // Client goes away: the response (and its body stream) is dropped
            let resp = handler.await.unwrap();
            drop(resp);

            // Next chunk can't be written, which aborts the request
            mux.deliver(RelayEvent::Chunk {
                request_id: id,
                data: "data: x\n\n".to_string(),
            });

            tokio::time::timeout(Duration::from_secs(2), relay_rx.recv())
                .await
                .expect("expected a cancel frame")
                .unwrap()
        };

        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["event_type"], "cancel_request");

        // Cancellation is not an upstream failure
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = state.rotation.snapshot();
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.active_requests, 0);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_401() {
        let state = test_state(StreamingMode::Real, 1);
        let _relay_rx = attach_relay(&state);

        let req = Request::builder()
            .method("POST")
            .uri("/v1beta/models/gemini-pro:generateContent")
            .body(Body::from("{}"))
            .unwrap();
        let resp = proxy_handler(State(state.clone()), req).await;
        assert_eq!(resp.status(), 401);
        // Rejected before the acceptance gate
        assert_eq!(state.rotation.snapshot().active_requests, 0);
    }
}
