//! Google → OpenAI response translation
//!
//! Stream chunks are rewritten one SSE frame at a time; buffered responses
//! are assembled into a complete `chat.completion` object. Thinking parts
//! land in `reasoning_content`, inline images become a placeholder in
//! streams and a full Markdown data URI in buffered responses.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};

/// How inline image parts are rendered into assistant text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageRendering {
    /// `![Image]` - streams can't carry megabytes of base64 usefully
    Placeholder,
    /// Full `![image](data:<mime>;base64,<data>)` URI
    DataUri,
}

/// Parse an SSE "data:" line into JSON.
///
/// Accepts frames with or without the `data: ` prefix. Returns None for
/// empty payloads and the `[DONE]` terminator.
fn parse_sse_data(frame: &str) -> Option<Value> {
    let payload = frame.trim();
    let payload = payload.strip_prefix("data:").unwrap_or(payload).trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    serde_json::from_str(payload).ok()
}

/// Walk `candidates[0].content.parts`, splitting text into visible content
/// and thinking, rendering images per `mode`.
fn collect_parts(candidate: &Value, mode: ImageRendering) -> (String, String) {
    let mut content = String::new();
    let mut reasoning = String::new();

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array());
    let Some(parts) = parts else {
        return (content, reasoning);
    };

    for part in parts {
        if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                reasoning.push_str(text);
            }
        } else if let Some(inline) = part.get("inlineData") {
            match mode {
                ImageRendering::Placeholder => content.push_str("![Image]"),
                ImageRendering::DataUri => content.push_str(&inline_data_markdown(inline)),
            }
        } else if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            content.push_str(text);
        }
    }

    (content, reasoning)
}

fn inline_data_markdown(inline: &Value) -> String {
    let mime = inline
        .get("mimeType")
        .and_then(|m| m.as_str())
        .unwrap_or("image/png");
    let data = inline.get("data").and_then(|d| d.as_str()).unwrap_or("");
    format!("![image](data:{};base64,{})", mime, data)
}

fn finish_reason(candidate: &Value) -> Option<String> {
    candidate
        .get("finishReason")
        .and_then(|f| f.as_str())
        .map(String::from)
}

// ============================================================================
// Streaming
// ============================================================================

/// Translate one Google SSE frame into an OpenAI `chat.completion.chunk`.
///
/// Returns None when the frame carries neither content nor a finish reason
/// (the chunk is suppressed), or when it isn't parseable JSON.
pub fn translate_stream_chunk(frame: &str, request_id: &str, model: &str) -> Option<Value> {
    let parsed = parse_sse_data(frame)?;
    let candidate = parsed.get("candidates").and_then(|c| c.get(0))?;

    let (content, reasoning) = collect_parts(candidate, ImageRendering::Placeholder);
    let finish = finish_reason(candidate);

    if content.is_empty() && reasoning.is_empty() && finish.is_none() {
        return None;
    }

    let mut delta = serde_json::Map::new();
    if !content.is_empty() {
        delta.insert("content".to_string(), json!(content));
    }
    if !reasoning.is_empty() {
        delta.insert("reasoning_content".to_string(), json!(reasoning));
    }

    Some(json!({
        "id": format!("chatcmpl-{}", request_id),
        "object": "chat.completion.chunk",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": Value::Object(delta),
            "finish_reason": finish,
        }],
    }))
}

// ============================================================================
// Buffered
// ============================================================================

/// Assemble a buffered Google response into an OpenAI `chat.completion`.
pub fn translate_buffered(raw: &str, request_id: &str, model: &str) -> Result<Value> {
    let parsed: Value =
        serde_json::from_str(raw.trim()).context("Upstream response is not valid JSON")?;
    let candidate = parsed
        .get("candidates")
        .and_then(|c| c.get(0))
        .cloned()
        .unwrap_or(Value::Null);

    let (content, reasoning) = collect_parts(&candidate, ImageRendering::DataUri);
    let finish = finish_reason(&candidate).unwrap_or_else(|| "UNKNOWN".to_string());

    Ok(json!({
        "id": format!("chatcmpl-{}", request_id),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": content,
                "reasoning_content": if reasoning.is_empty() { Value::Null } else { json!(reasoning) },
            },
            "finish_reason": finish,
        }],
    }))
}

/// Collapse a buffered Google response into a single stream chunk. Used by
/// pseudo streaming on the OpenAI surface: the whole reply arrives as one
/// delta followed by the `[DONE]` terminator.
pub fn buffered_to_stream_chunk(raw: &str, request_id: &str, model: &str) -> Result<Value> {
    let parsed: Value =
        serde_json::from_str(raw.trim()).context("Upstream response is not valid JSON")?;
    let candidate = parsed
        .get("candidates")
        .and_then(|c| c.get(0))
        .cloned()
        .unwrap_or(Value::Null);

    let (content, reasoning) = collect_parts(&candidate, ImageRendering::Placeholder);
    let finish = finish_reason(&candidate).unwrap_or_else(|| "STOP".to_string());

    let mut delta = serde_json::Map::new();
    delta.insert("role".to_string(), json!("assistant"));
    delta.insert("content".to_string(), json!(content));
    if !reasoning.is_empty() {
        delta.insert("reasoning_content".to_string(), json!(reasoning));
    }

    Ok(json!({
        "id": format!("chatcmpl-{}", request_id),
        "object": "chat.completion.chunk",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": Value::Object(delta),
            "finish_reason": finish,
        }],
    }))
}

// ============================================================================
// Google-surface helpers
// ============================================================================

/// Rewrite `inlineData` parts of a Google response in place as Markdown
/// image URIs. Applied to buffered Google-surface responses so image parts
/// survive JSON clients that only render text.
pub fn rewrite_inline_images(body: &mut Value) {
    let Some(candidates) = body.get_mut("candidates").and_then(|c| c.as_array_mut()) else {
        return;
    };
    for candidate in candidates {
        let Some(parts) = candidate
            .get_mut("content")
            .and_then(|c| c.get_mut("parts"))
            .and_then(|p| p.as_array_mut())
        else {
            continue;
        };
        for part in parts {
            let Some(inline) = part.get("inlineData") else {
                continue;
            };
            let markdown = inline_data_markdown(inline);
            *part = json!({"text": markdown});
        }
    }
}

/// Translate an upstream model listing into the OpenAI shape.
pub fn translate_models_list(raw: &str) -> Result<Value> {
    let parsed: Value =
        serde_json::from_str(raw.trim()).context("Model list is not valid JSON")?;
    let created = Utc::now().timestamp();
    let data: Vec<Value> = parsed
        .get("models")
        .and_then(|m| m.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                .map(|name| {
                    json!({
                        "id": name.strip_prefix("models/").unwrap_or(name),
                        "object": "model",
                        "created": created,
                        "owned_by": "google",
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(json!({"object": "list", "data": data}))
}
