//! Proxy error types and response handling

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

/// Errors that can occur during proxying
#[derive(Debug)]
pub(crate) enum ProxyError {
    /// API key missing or not in the allowlist
    Unauthorized,
    /// A credential rotation is pending or executing
    Rotating,
    /// Rotation failed beyond rollback; needs external intervention
    Unavailable,
    /// The browser relay is not connected and recovery failed
    RelayOffline,
    BodyRead(String),
    /// Terminal error reported by the relay for this request
    Upstream {
        status: Option<u16>,
        message: String,
    },
    /// The relay connection was lost past the grace window mid-request
    QueueClosed,
    /// No relay event arrived within the deadline
    Timeout,
    ResponseBuild(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match self {
            ProxyError::Unauthorized => (StatusCode::UNAUTHORIZED, "Invalid API key".to_string()),
            ProxyError::Rotating => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Rotating accounts, retry shortly".to_string(),
            ),
            ProxyError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable: account rotation failed".to_string(),
            ),
            ProxyError::RelayOffline => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Browser relay is not connected".to_string(),
            ),
            ProxyError::BodyRead(msg) => (StatusCode::BAD_REQUEST, msg),
            ProxyError::Upstream { status, message } => (
                status
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(StatusCode::BAD_GATEWAY),
                message,
            ),
            ProxyError::QueueClosed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Relay connection lost".to_string(),
            ),
            ProxyError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "Upstream response timed out".to_string(),
            ),
            ProxyError::ResponseBuild(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        tracing::error!("Proxy error: {} - {}", status, message);

        let body = json!({"error": {"code": status.as_u16(), "message": message}}).to_string();
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::from("Internal error building error response")))
    }
}
