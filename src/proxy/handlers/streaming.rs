//! Real pass-through streaming
//!
//! Upstream chunks are forwarded as they arrive. The first relay event
//! fixes the response status; once the status line is written, later errors
//! can only surface as SSE frames in the body. A stalled stream (no chunk
//! within the inter-chunk deadline) is abandoned and cancelled on the relay
//! side.

use super::{sse_error_frame, RequestGuard, ResponseKind, GENERAL_TIMEOUT, INTER_CHUNK_TIMEOUT};
use crate::proxy::error::ProxyError;
use crate::proxy::state::ProxyState;
use crate::relay::{QueueMessage, RecvError, RelayRequest, RequestQueue};
use crate::translation::response as response_translation;
use axum::body::Body;
use axum::http::Response;
use bytes::Bytes;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub(super) async fn run_real_stream(
    state: ProxyState,
    frame: RelayRequest,
    mut queue: RequestQueue,
    guard: RequestGuard,
    kind: ResponseKind,
) -> Result<Response<Body>, ProxyError> {
    if state.channel.send(&frame).is_err() {
        guard.complete();
        return Err(ProxyError::RelayOffline);
    }

    // The first event decides how the response starts
    let (status, upstream_headers) = match queue.recv(GENERAL_TIMEOUT).await {
        Ok(QueueMessage::Headers { status, headers }) => (status, headers),
        Ok(QueueMessage::Error { status, message }) => {
            if !message.contains("aborted") {
                state.rotation.record_error(status);
            }
            guard.complete();
            return Err(ProxyError::Upstream { status, message });
        }
        Ok(QueueMessage::Chunk { .. }) | Ok(QueueMessage::StreamEnd) => {
            guard.complete();
            return Err(ProxyError::Upstream {
                status: None,
                message: "Stream ended before response headers".to_string(),
            });
        }
        Err(RecvError::Closed) => {
            guard.complete();
            return Err(ProxyError::QueueClosed);
        }
        // Dropping the guard sends cancel_request for the abandoned call
        Err(RecvError::Timeout) => return Err(ProxyError::Timeout),
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(pump(state, queue, guard, tx, kind));

    let mut builder = Response::builder().status(status);
    for (name, value) in &upstream_headers {
        // Content-Length is meaningless for a stream; Content-Type is forced
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("content-type")
        {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
}

/// Drain the queue into the response body until the stream ends.
async fn pump(
    state: ProxyState,
    mut queue: RequestQueue,
    guard: RequestGuard,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    kind: ResponseKind,
) {
    // Logging only; a scrape miss never affects the stream
    let finish_re = Regex::new(r#""finishReason"\s*:\s*"([A-Za-z_]+)""#).ok();

    loop {
        match queue.recv(INTER_CHUNK_TIMEOUT).await {
            Ok(QueueMessage::Chunk { data }) => {
                if let Some(re) = &finish_re {
                    if let Some(cap) = re.captures(&data) {
                        tracing::debug!("Stream {} finishReason: {}", guard.request_id(), &cap[1]);
                    }
                }
                let payload = match &kind {
                    ResponseKind::Google | ResponseKind::ModelsList => Some(data),
                    ResponseKind::OpenAiChat { model } => {
                        response_translation::translate_stream_chunk(
                            &data,
                            guard.request_id(),
                            model,
                        )
                        .map(|chunk| format!("data: {}\n\n", chunk))
                    }
                };
                if let Some(payload) = payload {
                    if tx.send(Ok(Bytes::from(payload))).await.is_err() {
                        // Client went away; the guard's drop cancels upstream
                        tracing::info!("Client disconnected from stream {}", guard.request_id());
                        return;
                    }
                }
            }
            Ok(QueueMessage::StreamEnd) => {
                if matches!(kind, ResponseKind::OpenAiChat { .. }) {
                    let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
                }
                state.rotation.record_success();
                guard.complete();
                return;
            }
            Ok(QueueMessage::Error { status, message }) => {
                // Status already committed; surface the error in-band
                if !message.contains("aborted") {
                    state.rotation.record_error(status);
                }
                let _ = tx
                    .send(Ok(Bytes::from(sse_error_frame(status, &message))))
                    .await;
                guard.complete();
                return;
            }
            Ok(QueueMessage::Headers { .. }) => {
                tracing::debug!("Ignoring duplicate headers for {}", guard.request_id());
            }
            Err(RecvError::Timeout) => {
                tracing::warn!(
                    "Stream {} stalled past {:?}, abandoning",
                    guard.request_id(),
                    INTER_CHUNK_TIMEOUT
                );
                return; // guard drop cancels the relay side
            }
            Err(RecvError::Closed) => {
                tracing::warn!("Relay lost mid-stream for {}", guard.request_id());
                // Nothing left to cancel; the connection is gone
                guard.complete();
                return;
            }
        }
    }
}
