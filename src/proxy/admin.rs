//! Control & status surface
//!
//! Admin routes are gated by a session cookie minted at login (API key as
//! password), separate from the public API-key auth. Everything returns
//! JSON; the login page is the only HTML this crate serves.

use crate::config::StreamingMode;
use crate::proxy::state::ProxyState;
use crate::rotation::SwitchOutcome;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Form, Json,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::Ordering;

const SESSION_COOKIE: &str = "admin_session";

// ============================================================================
// Session handling
// ============================================================================

fn mint_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Pull the admin session token out of the Cookie header.
fn parse_session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

fn require_session(state: &ProxyState, headers: &HeaderMap) -> Result<(), Response> {
    let authorized = parse_session_cookie(headers)
        .map(|token| state.admin_sessions.lock().unwrap().contains(&token))
        .unwrap_or(false);
    if authorized {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "admin session required"})),
        )
            .into_response())
    }
}

// ============================================================================
// Login
// ============================================================================

pub async fn login_page() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head><title>camobridge admin</title></head>
<body>
<form method="post" action="/login">
  <label>API key: <input type="password" name="password"></label>
  <button type="submit">Log in</button>
</form>
</body>
</html>"#,
    )
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    password: String,
}

pub async fn login(State(state): State<ProxyState>, Form(form): Form<LoginForm>) -> Response {
    if !state.config.api_keys.iter().any(|k| *k == form.password) {
        tracing::warn!("Admin login rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "wrong password"})),
        )
            .into_response();
    }

    let token = mint_token();
    state.admin_sessions.lock().unwrap().insert(token.clone());
    tracing::info!("Admin session opened");

    (
        [(
            header::SET_COOKIE,
            format!("{}={}; HttpOnly; Path=/; SameSite=Lax", SESSION_COOKIE, token),
        )],
        Json(json!({"ok": true})),
    )
        .into_response()
}

// ============================================================================
// Status
// ============================================================================

pub async fn status(State(state): State<ProxyState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }

    let snapshot = state.rotation.snapshot();
    let accounts: Vec<_> = state
        .store
        .available_indices()
        .iter()
        .map(|&index| {
            json!({
                "index": index,
                "name": state.store.name_of(index),
            })
        })
        .collect();
    let logs: Vec<String> = state
        .log_buffer
        .get_all()
        .iter()
        .map(|entry| entry.render())
        .collect();

    Json(json!({
        "streamingMode": state.flags.streaming_mode().as_str(),
        "flags": {
            "openaiReasoning": state.flags.openai_reasoning.load(Ordering::Relaxed),
            "nativeReasoning": state.flags.native_reasoning.load(Ordering::Relaxed),
            "redirect2530": state.flags.redirect_25_to_30.load(Ordering::Relaxed),
            "resumeEnabled": state.flags.resume_enabled(),
            "resumeLimit": state.flags.resume_limit.load(Ordering::Relaxed),
        },
        "browserConnected": state.channel.is_connected(),
        "currentAuthIndex": snapshot.current_index,
        "accountName": state.store.name_of(snapshot.current_index),
        "usageCount": format!("{}/{}", snapshot.usage_count, state.config.switch_on_uses),
        "failureCount": format!("{}/{}", snapshot.failure_count, state.config.failure_threshold),
        "pendingSwitch": snapshot.pending_switch,
        "authSwitching": snapshot.auth_switching,
        "systemBusy": snapshot.system_busy,
        "unavailable": snapshot.unavailable,
        "activeRequests": snapshot.active_requests,
        "liveQueues": state.mux.len(),
        "maxAuthIndex": state.store.max_index(),
        "accounts": accounts,
        "logs": logs,
    }))
    .into_response()
}

// ============================================================================
// Controls
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SwitchAccountRequest {
    #[serde(default, alias = "targetIndex")]
    target_index: Option<u32>,
}

pub async fn switch_account(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Json(req): Json<SwitchAccountRequest>,
) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }

    tracing::info!("Manual account switch requested ({:?})", req.target_index);
    let body = match state.rotation.manual_switch(req.target_index).await {
        SwitchOutcome::Switched(index) => json!({"success": true, "index": index}),
        SwitchOutcome::Deferred => {
            json!({"success": true, "deferred": true, "reason": "waiting for in-flight requests"})
        }
        SwitchOutcome::Busy => json!({"success": false, "reason": "a switch is already running"}),
        SwitchOutcome::Unavailable => {
            json!({"success": false, "reason": "rotation is unavailable; restart required"})
        }
        SwitchOutcome::Failed(reason) => json!({"success": false, "reason": reason}),
    };
    Json(body).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SetModeRequest {
    mode: String,
}

pub async fn set_mode(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Json(req): Json<SetModeRequest>,
) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }
    let Some(mode) = StreamingMode::parse(&req.mode) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "mode must be \"real\" or \"fake\""})),
        )
            .into_response();
    };
    state.flags.set_streaming_mode(mode);
    tracing::info!("Streaming mode set to {}", mode.as_str());
    Json(json!({"streamingMode": mode.as_str()})).into_response()
}

pub async fn toggle_reasoning(State(state): State<ProxyState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }
    let enabled = !state.flags.openai_reasoning.fetch_xor(true, Ordering::Relaxed);
    tracing::info!("OpenAI reasoning toggled to {}", enabled);
    Json(json!({"openaiReasoning": enabled})).into_response()
}

pub async fn toggle_native_reasoning(
    State(state): State<ProxyState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }
    let enabled = !state.flags.native_reasoning.fetch_xor(true, Ordering::Relaxed);
    tracing::info!("Native reasoning toggled to {}", enabled);
    Json(json!({"nativeReasoning": enabled})).into_response()
}

pub async fn toggle_redirect(State(state): State<ProxyState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }
    let enabled = !state.flags.redirect_25_to_30.fetch_xor(true, Ordering::Relaxed);
    tracing::info!("gemini-2.5-pro redirect toggled to {}", enabled);
    Json(json!({"redirect2530": enabled})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ResumeConfigRequest {
    limit: u32,
}

pub async fn set_resume_config(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Json(req): Json<ResumeConfigRequest>,
) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }
    state.flags.resume_limit.store(req.limit, Ordering::Relaxed);
    tracing::info!("Resume limit set to {}", req.limit);
    Json(json!({
        "resumeEnabled": state.flags.resume_enabled(),
        "resumeLimit": req.limit,
    }))
    .into_response()
}
