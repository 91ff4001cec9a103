// Relay wire protocol - JSON frames exchanged with the page-side script
//
// Each frame is a single JSON text message. Inbound events are tagged by
// `event_type` and always carry the request_id they belong to; frames
// without one are dropped by the channel.

use crate::config::StreamingMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A proxied HTTP request, forwarded to the in-page relay for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    pub streaming_mode: StreamingMode,
    pub is_generative: bool,
    /// Opaque pass-through: the page script handles resume internally
    pub resume_on_prohibit: bool,
    pub resume_limit: u32,
    pub client_wants_stream: bool,
}

/// Events the relay sends back for a request.
///
/// Per request_id the sequence is either
/// `response_headers chunk* stream_close` or a single `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum RelayEvent {
    ResponseHeaders {
        request_id: String,
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Chunk {
        request_id: String,
        data: String,
    },
    Error {
        request_id: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        message: String,
    },
    StreamClose {
        request_id: String,
    },
}

impl RelayEvent {
    pub fn request_id(&self) -> &str {
        match self {
            RelayEvent::ResponseHeaders { request_id, .. }
            | RelayEvent::Chunk { request_id, .. }
            | RelayEvent::Error { request_id, .. }
            | RelayEvent::StreamClose { request_id } => request_id,
        }
    }
}

/// Control frames the proxy sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ControlFrame {
    CancelRequest { request_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_event_parses_tagged_frames() {
        let frame = r#"{"event_type":"response_headers","request_id":"r1","status":200,"headers":{"content-type":"application/json"}}"#;
        let event: RelayEvent = serde_json::from_str(frame).unwrap();
        match event {
            RelayEvent::ResponseHeaders {
                request_id,
                status,
                headers,
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(status, 200);
                assert_eq!(headers.get("content-type").unwrap(), "application/json");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let frame = r#"{"event_type":"stream_close","request_id":"r1"}"#;
        let event: RelayEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(event.request_id(), "r1");
    }

    #[test]
    fn test_error_frame_with_missing_fields() {
        let frame = r#"{"event_type":"error","request_id":"r2"}"#;
        let event: RelayEvent = serde_json::from_str(frame).unwrap();
        match event {
            RelayEvent::Error {
                status, message, ..
            } => {
                assert_eq!(status, None);
                assert_eq!(message, "");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_cancel_frame_shape() {
        let frame = ControlFrame::CancelRequest {
            request_id: "r3".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event_type"], "cancel_request");
        assert_eq!(json["request_id"], "r3");
    }

    #[test]
    fn test_relay_request_serializes_mode_lowercase() {
        let req = RelayRequest {
            request_id: "r4".to_string(),
            method: "POST".to_string(),
            path: "/v1beta/models/gemini-pro:generateContent".to_string(),
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: "{}".to_string(),
            streaming_mode: StreamingMode::Fake,
            is_generative: true,
            resume_on_prohibit: false,
            resume_limit: 0,
            client_wants_stream: false,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["streaming_mode"], "fake");
        assert_eq!(json["is_generative"], true);
    }
}
