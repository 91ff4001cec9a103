//! Buffered response modes: pseudo streaming and plain non-streaming
//!
//! Both run the relay in `fake` mode and aggregate the whole upstream body.
//! Pseudo streaming opens an SSE response immediately, keeps the client
//! alive with heartbeats while the upstream call runs, then emits the
//! buffered payload as a single data frame. Retries apply only here; an
//! error whose message contains "aborted" is a client cancellation and is
//! never retried.

use super::{sse_error_frame, RequestGuard, ResponseKind, KEEPALIVE_INTERVAL, WHOLE_BODY_TIMEOUT};
use crate::proxy::error::ProxyError;
use crate::proxy::state::ProxyState;
use crate::relay::{QueueMessage, RecvError, RelayRequest, RequestQueue};
use crate::rotation::ErrorDisposition;
use crate::translation::response as response_translation;
use axum::body::Body;
use axum::http::Response;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

// ============================================================================
// Pseudo streaming
// ============================================================================

pub(super) async fn run_pseudo_stream(
    state: ProxyState,
    frame: RelayRequest,
    queue: RequestQueue,
    guard: RequestGuard,
    kind: ResponseKind,
) -> Result<Response<Body>, ProxyError> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(pseudo_pump(state, frame, queue, guard, kind, tx));

    Response::builder()
        .status(200)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
}

async fn pseudo_pump(
    state: ProxyState,
    frame: RelayRequest,
    mut queue: RequestQueue,
    guard: RequestGuard,
    kind: ResponseKind,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let max_retries = state.config.max_retries;
    let retry_delay = Duration::from_millis(state.config.retry_delay_ms);
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
        KEEPALIVE_INTERVAL,
    );

    let mut attempt: u32 = 0;
    'attempts: loop {
        if state.channel.send(&frame).is_err() {
            let _ = tx
                .send(Ok(Bytes::from(sse_error_frame(
                    None,
                    "Browser relay is not connected",
                ))))
                .await;
            guard.complete();
            return;
        }

        let deadline = tokio::time::Instant::now() + WHOLE_BODY_TIMEOUT;
        let mut buffer = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::select! {
                _ = heartbeat.tick() => {
                    if tx.send(Ok(Bytes::from(": keep-alive\n\n"))).await.is_err() {
                        // Client gone; the guard's drop cancels upstream
                        tracing::info!("Client disconnected during pseudo-stream wait");
                        return;
                    }
                }
                msg = queue.recv(remaining) => match msg {
                    Ok(QueueMessage::Headers { .. }) => {}
                    Ok(QueueMessage::Chunk { data }) => buffer.push_str(&data),
                    Ok(QueueMessage::StreamEnd) => break,
                    Ok(QueueMessage::Error { status, message }) => {
                        if message.contains("aborted") {
                            // Client-side cancellation: never retried, not a
                            // credential failure
                            let _ = tx.send(Ok(Bytes::from(sse_error_frame(status, &message)))).await;
                            guard.complete();
                            return;
                        }
                        let disposition = state.rotation.record_error(status);
                        if attempt < max_retries && disposition == ErrorDisposition::Retryable {
                            attempt += 1;
                            tracing::warn!(
                                "Pseudo-stream attempt {} failed ({}), retrying in {:?}",
                                attempt, message, retry_delay
                            );
                            tokio::time::sleep(retry_delay).await;
                            continue 'attempts;
                        }
                        let _ = tx.send(Ok(Bytes::from(sse_error_frame(status, &message)))).await;
                        guard.complete();
                        return;
                    }
                    Err(RecvError::Closed) => {
                        let _ = tx.send(Ok(Bytes::from(sse_error_frame(None, "Relay connection lost")))).await;
                        guard.complete();
                        return;
                    }
                    Err(RecvError::Timeout) => {
                        tracing::warn!("Pseudo-stream {} timed out", guard.request_id());
                        let _ = tx.send(Ok(Bytes::from(sse_error_frame(None, "Upstream response timed out")))).await;
                        return; // guard drop cancels the relay side
                    }
                }
            }
        }

        state.rotation.record_success();

        let payload = match &kind {
            ResponseKind::Google | ResponseKind::ModelsList => buffer.trim().to_string(),
            ResponseKind::OpenAiChat { model } => {
                match response_translation::buffered_to_stream_chunk(
                    &buffer,
                    guard.request_id(),
                    model,
                ) {
                    Ok(chunk) => chunk.to_string(),
                    Err(e) => {
                        tracing::warn!("Buffered response translation failed: {:#}", e);
                        let _ = tx
                            .send(Ok(Bytes::from(sse_error_frame(
                                None,
                                "Upstream response was not valid JSON",
                            ))))
                            .await;
                        guard.complete();
                        return;
                    }
                }
            }
        };

        if tx
            .send(Ok(Bytes::from(format!("data: {}\n\n", payload))))
            .await
            .is_err()
        {
            return;
        }
        let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
        guard.complete();
        return;
    }
}

// ============================================================================
// Non-streaming
// ============================================================================

pub(super) async fn run_non_stream(
    state: ProxyState,
    frame: RelayRequest,
    mut queue: RequestQueue,
    guard: RequestGuard,
    kind: ResponseKind,
    overall_timeout: Duration,
) -> Result<Response<Body>, ProxyError> {
    if state.channel.send(&frame).is_err() {
        guard.complete();
        return Err(ProxyError::RelayOffline);
    }

    let deadline = tokio::time::Instant::now() + overall_timeout;
    let mut status: u16 = 200;
    let mut buffer = String::new();
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match queue.recv(remaining).await {
            Ok(QueueMessage::Headers { status: s, .. }) => status = s,
            Ok(QueueMessage::Chunk { data }) => buffer.push_str(&data),
            Ok(QueueMessage::StreamEnd) => break,
            Ok(QueueMessage::Error {
                status: err_status,
                message,
            }) => {
                if !message.contains("aborted") {
                    state.rotation.record_error(err_status);
                }
                guard.complete();
                return Err(ProxyError::Upstream {
                    status: err_status,
                    message,
                });
            }
            Err(RecvError::Closed) => {
                guard.complete();
                return Err(ProxyError::QueueClosed);
            }
            // Guard drop cancels the still-running relay call
            Err(RecvError::Timeout) => return Err(ProxyError::Timeout),
        }
    }

    state.rotation.record_success();
    let request_id = guard.request_id().to_string();
    let result = build_response(kind, status, buffer, &request_id);
    guard.complete();
    result
}

fn build_response(
    kind: ResponseKind,
    status: u16,
    buffer: String,
    request_id: &str,
) -> Result<Response<Body>, ProxyError> {
    match kind {
        ResponseKind::Google => {
            // Image parts are rewritten in place; non-JSON bodies pass
            // through untouched
            let body = match serde_json::from_str::<serde_json::Value>(buffer.trim()) {
                Ok(mut parsed) => {
                    response_translation::rewrite_inline_images(&mut parsed);
                    parsed.to_string()
                }
                Err(_) => buffer,
            };
            json_response(status, body)
        }
        ResponseKind::OpenAiChat { model } => {
            let completion = response_translation::translate_buffered(&buffer, request_id, &model)
                .map_err(|e| ProxyError::Upstream {
                    status: None,
                    message: format!("Upstream response was not valid JSON: {:#}", e),
                })?;
            json_response(status, completion.to_string())
        }
        ResponseKind::ModelsList => {
            let list =
                response_translation::translate_models_list(&buffer).map_err(|e| {
                    ProxyError::Upstream {
                        status: None,
                        message: format!("Upstream model list was not valid JSON: {:#}", e),
                    }
                })?;
            json_response(200, list.to_string())
        }
    }
}

fn json_response(status: u16, body: String) -> Result<Response<Body>, ProxyError> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
}
