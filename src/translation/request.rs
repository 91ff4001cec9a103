//! OpenAI → Google request translation
//!
//! Converts OpenAI Chat Completions requests to the Google generateContent
//! format.
//!
//! # Key Differences
//!
//! | OpenAI                        | Google                               |
//! |-------------------------------|--------------------------------------|
//! | `messages[].role: "system"`   | Top-level `systemInstruction`        |
//! | `role: "assistant"`           | `role: "model"`                      |
//! | `max_tokens`                  | `generationConfig.maxOutputTokens`   |
//! | `stop` (string/array)         | `generationConfig.stopSequences`     |
//! | `image_url` data URLs         | `inlineData {mimeType, data}`        |

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Model substituted when the 2.5-pro redirect is enabled
const REDIRECT_FROM: &str = "gemini-2.5-pro";
const REDIRECT_TO: &str = "gemini-3-pro-preview";

/// Runtime toggles that shape the translated request.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslateOptions {
    /// Ask the model to stream its thinking parts
    pub include_thoughts: bool,
    /// Substitute gemini-2.5-pro with its preview successor
    pub redirect_25_to_30: bool,
}

/// A chat/completions request rewritten for the relay.
#[derive(Debug)]
pub struct TranslatedChat {
    pub path: String,
    pub query_params: HashMap<String, String>,
    pub body: String,
    pub stream: bool,
    pub model: String,
}

/// Apply the 2.5 → 3.0 redirect to a model name or path segment.
pub fn redirect_model(name: &str) -> String {
    name.replace(REDIRECT_FROM, REDIRECT_TO)
}

// ============================================================================
// OpenAI Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    top_k: Option<u32>,
    #[serde(default)]
    stop: Option<StopSequence>,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(default)]
    content: Option<OpenAiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum OpenAiContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Deserialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StopSequence {
    Single(String),
    Multiple(Vec<String>),
}

// ============================================================================
// Translation
// ============================================================================

/// Translate an OpenAI chat request into a Google generateContent call.
pub fn translate_chat_request(body: &[u8], opts: &TranslateOptions) -> Result<TranslatedChat> {
    let request: OpenAiChatRequest =
        serde_json::from_slice(body).context("Failed to parse OpenAI request")?;

    let stream = request.stream.unwrap_or(false);
    let model = if opts.redirect_25_to_30 {
        redirect_model(&request.model)
    } else {
        request.model.clone()
    };

    let (system_instruction, contents) = convert_messages(&request.messages);

    let mut google_body = Map::new();
    if let Some(system) = system_instruction {
        google_body.insert("systemInstruction".to_string(), system);
    }
    google_body.insert("contents".to_string(), Value::Array(contents));

    let generation_config = build_generation_config(&request, opts);
    if !generation_config.is_empty() {
        google_body.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }
    google_body.insert("safetySettings".to_string(), safety_settings());

    let verb = if stream {
        "streamGenerateContent"
    } else {
        "generateContent"
    };
    let path = format!("/v1beta/models/{}:{}", model, verb);

    let mut query_params = HashMap::new();
    if stream {
        query_params.insert("alt".to_string(), "sse".to_string());
    }

    Ok(TranslatedChat {
        path,
        query_params,
        body: Value::Object(google_body).to_string(),
        stream,
        model,
    })
}

/// Merge system messages into one instruction and convert the rest.
fn convert_messages(messages: &[OpenAiMessage]) -> (Option<Value>, Vec<Value>) {
    let mut system_parts: Vec<String> = Vec::new();
    let mut contents = Vec::new();

    for msg in messages {
        if msg.role == "system" {
            if let Some(content) = &msg.content {
                match content {
                    OpenAiContent::Text(text) => system_parts.push(text.clone()),
                    OpenAiContent::Parts(parts) => {
                        for part in parts {
                            if let OpenAiContentPart::Text { text } = part {
                                system_parts.push(text.clone());
                            }
                        }
                    }
                }
            }
            continue;
        }

        let role = if msg.role == "assistant" {
            "model"
        } else {
            msg.role.as_str()
        };
        let parts = match &msg.content {
            Some(OpenAiContent::Text(text)) => vec![json!({"text": text})],
            Some(OpenAiContent::Parts(list)) => list.iter().filter_map(convert_part).collect(),
            None => Vec::new(),
        };
        contents.push(json!({"role": role, "parts": parts}));
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(json!({"parts": [{"text": system_parts.join("\n")}]}))
    };

    (system, contents)
}

fn convert_part(part: &OpenAiContentPart) -> Option<Value> {
    match part {
        OpenAiContentPart::Text { text } => Some(json!({"text": text})),
        OpenAiContentPart::ImageUrl { image_url } => convert_image_url(&image_url.url),
    }
}

/// `data:<mime>;base64,<data>` URLs become inlineData; anything else is
/// dropped because the relay cannot fetch external resources.
fn convert_image_url(url: &str) -> Option<Value> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime_type = header.split(';').next().unwrap_or("image/png");
    Some(json!({"inlineData": {"mimeType": mime_type, "data": data}}))
}

fn build_generation_config(request: &OpenAiChatRequest, opts: &TranslateOptions) -> Map<String, Value> {
    let mut config = Map::new();
    if let Some(t) = request.temperature {
        config.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = request.top_p {
        config.insert("topP".to_string(), json!(p));
    }
    if let Some(k) = request.top_k {
        config.insert("topK".to_string(), json!(k));
    }
    if let Some(m) = request.max_tokens {
        config.insert("maxOutputTokens".to_string(), json!(m));
    }
    if let Some(stop) = &request.stop {
        let sequences = match stop {
            StopSequence::Single(s) => vec![s.clone()],
            StopSequence::Multiple(v) => v.clone(),
        };
        config.insert("stopSequences".to_string(), json!(sequences));
    }
    if opts.include_thoughts {
        config.insert(
            "thinkingConfig".to_string(),
            json!({"includeThoughts": true}),
        );
    }
    config
}

/// All four harm categories unblocked; the relay account owns moderation.
fn safety_settings() -> Value {
    json!([
        {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE"},
        {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE"},
        {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE"},
        {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE"}
    ])
}
