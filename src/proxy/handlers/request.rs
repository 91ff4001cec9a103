//! Main proxy handler - accepts client HTTP and drives it over the relay
//!
//! The flow: authenticate, plan the forward target (translating the OpenAI
//! surface), pass the acceptance gate, attempt relay recovery if needed,
//! then hand off to the streaming or buffered driver.

use super::{
    buffered, mint_request_id, streaming, RequestGuard, ResponseKind, MODELS_TIMEOUT,
    WHOLE_BODY_TIMEOUT,
};
use crate::config::StreamingMode;
use crate::proxy::auth;
use crate::proxy::error::ProxyError;
use crate::proxy::state::ProxyState;
use crate::relay::RelayRequest;
use crate::rotation::AcceptError;
use crate::translation::{self, TranslateOptions};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Request, Response},
    response::IntoResponse,
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Main proxy handler - every non-admin path lands here
pub async fn proxy_handler(State(state): State<ProxyState>, req: Request<Body>) -> Response<Body> {
    match handle(state, req).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

/// The forward target and response treatment chosen for one request.
struct Plan {
    forward_path: String,
    forward_query: HashMap<String, String>,
    forward_body: String,
    wants_stream: bool,
    is_generative: bool,
    kind: ResponseKind,
    overall_timeout: Duration,
}

async fn handle(state: ProxyState, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let headers = req.headers().clone();
    let query = parse_query(uri.query());

    if !auth::authorize(&headers, &query, &state.config.api_keys) {
        tracing::warn!("Rejected {} {} (bad or missing API key)", method, path);
        return Err(ProxyError::Unauthorized);
    }

    let body_bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| ProxyError::BodyRead(e.to_string()))?;

    let plan = plan_request(&state, &method, &path, &headers, &query, &body_bytes)?;

    // Acceptance gate; counts the request as active on success
    state
        .rotation
        .try_accept(plan.is_generative)
        .map_err(|e| match e {
            AcceptError::Rotating => ProxyError::Rotating,
            AcceptError::Unavailable => ProxyError::Unavailable,
        })?;

    // Accepted: from here on, finalisation is the guard's responsibility
    let request_id = mint_request_id();
    let queue = state.mux.create_queue(&request_id);
    let guard = RequestGuard::new(
        request_id.clone(),
        state.rotation.clone(),
        state.mux.clone(),
        state.channel.clone(),
    );

    // One-shot auto-recovery when the relay is down and nothing else is
    // touching the browser
    if !state.channel.is_connected() {
        if state.rotation.try_begin_browser_op() {
            let index = state.rotation.current_index();
            tracing::warn!("Relay offline on accept, re-attaching bundle {}", index);
            let result = state.browser.switch_to(index).await;
            state.rotation.end_browser_op();
            if let Err(e) = result {
                tracing::warn!("Relay recovery failed: {:#}", e);
            }
        }
        if !state.channel.is_connected() {
            guard.complete();
            return Err(ProxyError::RelayOffline);
        }
    }

    // Non-streaming responses always run the relay in buffered mode
    let mode = if plan.wants_stream {
        state.flags.streaming_mode()
    } else {
        StreamingMode::Fake
    };

    let frame = RelayRequest {
        request_id: request_id.clone(),
        method: method.to_string(),
        path: plan.forward_path.clone(),
        headers: forward_headers(&headers),
        query_params: plan.forward_query,
        body: plan.forward_body,
        streaming_mode: mode,
        is_generative: plan.is_generative,
        resume_on_prohibit: state.flags.resume_enabled(),
        resume_limit: state.flags.resume_limit.load(Ordering::Relaxed),
        client_wants_stream: plan.wants_stream,
    };

    tracing::info!(
        "{} {} -> relay {} ({} mode)",
        method,
        path,
        request_id,
        mode.as_str()
    );

    if plan.wants_stream {
        match mode {
            StreamingMode::Real => {
                streaming::run_real_stream(state, frame, queue, guard, plan.kind).await
            }
            StreamingMode::Fake => {
                buffered::run_pseudo_stream(state, frame, queue, guard, plan.kind).await
            }
        }
    } else {
        buffered::run_non_stream(state, frame, queue, guard, plan.kind, plan.overall_timeout).await
    }
}

fn plan_request(
    state: &ProxyState,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<Plan, ProxyError> {
    // OpenAI-shape model listing, aggregated from the upstream list
    if *method == Method::GET && path == "/v1/models" {
        return Ok(Plan {
            forward_path: "/v1beta/models".to_string(),
            forward_query: HashMap::new(),
            forward_body: String::new(),
            wants_stream: false,
            is_generative: false,
            kind: ResponseKind::ModelsList,
            overall_timeout: MODELS_TIMEOUT,
        });
    }

    // OpenAI chat surface, rewritten into a generateContent call
    if *method == Method::POST && path == "/v1/chat/completions" {
        let opts = TranslateOptions {
            include_thoughts: state.flags.openai_reasoning.load(Ordering::Relaxed),
            redirect_25_to_30: state.flags.redirect_25_to_30.load(Ordering::Relaxed),
        };
        let translated = translation::translate_chat_request(body, &opts)
            .map_err(|e| ProxyError::BodyRead(format!("Invalid chat request: {:#}", e)))?;
        return Ok(Plan {
            forward_path: translated.path,
            forward_query: translated.query_params,
            forward_body: translated.body,
            wants_stream: translated.stream,
            is_generative: true,
            kind: ResponseKind::OpenAiChat {
                model: translated.model,
            },
            overall_timeout: WHOLE_BODY_TIMEOUT,
        });
    }

    // Google-surface passthrough
    let mut forward_path = path.to_string();
    if state.flags.redirect_25_to_30.load(Ordering::Relaxed) {
        forward_path = translation::redirect_model(&forward_path);
    }

    let is_generative = *method == Method::POST && forward_path.contains("generateContent");

    let mut forward_body = String::from_utf8_lossy(body).into_owned();
    if is_generative && state.flags.native_reasoning.load(Ordering::Relaxed) {
        forward_body = inject_thinking_config(&forward_body);
    }

    let wants_stream = forward_path.contains(":streamGenerateContent")
        || headers
            .get("accept")
            .and_then(|v| v.to_str().ok())
            .map(|a| a.contains("text/event-stream"))
            .unwrap_or(false);

    let mut forward_query = query.clone();
    // Client credential, never forwarded
    forward_query.remove("key");

    Ok(Plan {
        forward_path,
        forward_query,
        forward_body,
        wants_stream,
        is_generative,
        kind: ResponseKind::Google,
        overall_timeout: WHOLE_BODY_TIMEOUT,
    })
}

/// Ask for thinking parts on a native generative request. Bodies that don't
/// parse are forwarded untouched.
fn inject_thinking_config(body: &str) -> String {
    let Ok(mut parsed) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };
    let Some(obj) = parsed.as_object_mut() else {
        return body.to_string();
    };
    let config = obj
        .entry("generationConfig")
        .or_insert_with(|| serde_json::json!({}));
    if let Some(config) = config.as_object_mut() {
        config.insert(
            "thinkingConfig".to_string(),
            serde_json::json!({"includeThoughts": true}),
        );
    }
    parsed.to_string()
}

fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut query = HashMap::new();
    let Some(raw) = raw else {
        return query;
    };
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => query.insert(k.to_string(), v.to_string()),
            None => query.insert(pair.to_string(), String::new()),
        };
    }
    query
}

/// Headers safe to hand to the relay. Hop-by-hop headers and client
/// credentials are stripped; the browser context carries its own auth.
fn forward_headers(headers: &HeaderMap) -> HashMap<String, String> {
    const SKIP: &[&str] = &[
        "host",
        "connection",
        "content-length",
        "transfer-encoding",
        "accept-encoding",
        "authorization",
        "x-api-key",
        "x-goog-api-key",
        "cookie",
    ];
    let mut out = HashMap::new();
    for (key, value) in headers.iter() {
        let name = key.as_str();
        if SKIP.contains(&name) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.insert(name.to_string(), v.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_parse_query_and_key_strip() {
        let query = parse_query(Some("key=secret&alt=sse&flag"));
        assert_eq!(query.get("key").unwrap(), "secret");
        assert_eq!(query.get("alt").unwrap(), "sse");
        assert_eq!(query.get("flag").unwrap(), "");

        let mut forwarded = query.clone();
        forwarded.remove("key");
        assert!(!forwarded.contains_key("key"));
        assert!(forwarded.contains_key("alt"));
    }

    #[test]
    fn test_forward_headers_strip_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-goog-api-key", HeaderValue::from_static("secret"));
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("host", HeaderValue::from_static("proxy.local"));
        headers.insert("user-agent", HeaderValue::from_static("client/1.0"));

        let forwarded = forward_headers(&headers);
        assert_eq!(forwarded.get("content-type").unwrap(), "application/json");
        assert_eq!(forwarded.get("user-agent").unwrap(), "client/1.0");
        assert!(!forwarded.contains_key("x-goog-api-key"));
        assert!(!forwarded.contains_key("authorization"));
        assert!(!forwarded.contains_key("host"));
    }

    #[test]
    fn test_inject_thinking_config() {
        let out = inject_thinking_config(r#"{"contents":[]}"#);
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            parsed["generationConfig"]["thinkingConfig"]["includeThoughts"],
            true
        );

        // Existing generationConfig keys survive
        let out = inject_thinking_config(r#"{"generationConfig":{"temperature":0.3}}"#);
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["generationConfig"]["temperature"], 0.3);
        assert_eq!(
            parsed["generationConfig"]["thinkingConfig"]["includeThoughts"],
            true
        );

        // Unparseable bodies pass through untouched
        assert_eq!(inject_thinking_config("not json"), "not json");
    }
}
