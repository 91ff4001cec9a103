//! Configuration for the proxy
//!
//! Everything is loaded from environment variables with documented defaults.
//! Numeric values that fail to parse fall back to their defaults rather than
//! aborting startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

#[cfg(test)]
mod tests;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How streaming requests are serviced.
///
/// `Real` forwards upstream chunks as they arrive. `Fake` buffers the whole
/// upstream response and synthesises a short SSE stream from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    Real,
    Fake,
}

impl StreamingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamingMode::Real => "real",
            StreamingMode::Fake => "fake",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "real" => Some(StreamingMode::Real),
            "fake" => Some(StreamingMode::Fake),
            _ => None,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind both listeners to
    pub host: String,

    /// Port for the public HTTP API
    pub http_port: u16,

    /// Port for the relay WebSocket listener
    pub ws_port: u16,

    /// Default streaming strategy (admin can flip at runtime)
    pub streaming_mode: StreamingMode,

    /// Consecutive upstream failures before a rotation is forced (0 = off)
    pub failure_threshold: u32,

    /// Generative requests served before a rotation is scheduled (0 = off)
    pub switch_on_uses: u32,

    /// Retry attempts for buffered (pseudo-stream) requests
    pub max_retries: u32,

    /// Delay between retry attempts, in milliseconds
    pub retry_delay_ms: u64,

    /// Upstream statuses that force a rotation regardless of counters
    pub immediate_switch_status_codes: HashSet<u16>,

    /// Accepted client API keys
    pub api_keys: Vec<String>,

    /// Credential index loaded at startup
    pub initial_auth_index: u32,

    /// Path to the browser launcher; unset means the browser is unmanaged
    pub camoufox_executable_path: Option<PathBuf>,

    /// Directory scanned for `auth-<N>.json` bundles
    pub auth_dir: PathBuf,

    /// How long a browser switch may take before it is considered failed
    pub browser_ready_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 7860,
            ws_port: 9998,
            streaming_mode: StreamingMode::Real,
            failure_threshold: 3,
            switch_on_uses: 40,
            max_retries: 1,
            retry_delay_ms: 2000,
            immediate_switch_status_codes: [429, 503].into_iter().collect(),
            api_keys: vec!["123456".to_string()],
            initial_auth_index: 1,
            camoufox_executable_path: None,
            auth_dir: PathBuf::from("./auths"),
            browser_ready_timeout_secs: 90,
        }
    }
}

/// Parse an env var, falling back to `default` when unset or unparseable.
fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("Invalid {}={:?}, using default", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a comma-separated status code list, e.g. "429,503".
/// Entries that fail to parse are dropped; an empty result falls back.
fn parse_status_codes(raw: &str, default: HashSet<u16>) -> HashSet<u16> {
    let parsed: HashSet<u16> = raw
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if parsed.is_empty() {
        default
    } else {
        parsed
    }
}

/// Parse a comma-separated API key list, dropping empty entries.
fn parse_api_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let host = std::env::var("HOST").unwrap_or(defaults.host);
        let http_port = env_parse("PORT", defaults.http_port);
        let ws_port = env_parse("WS_PORT", defaults.ws_port);

        let streaming_mode = std::env::var("STREAMING_MODE")
            .ok()
            .and_then(|v| StreamingMode::parse(&v))
            .unwrap_or(defaults.streaming_mode);

        let failure_threshold = env_parse("FAILURE_THRESHOLD", defaults.failure_threshold);
        let switch_on_uses = env_parse("SWITCH_ON_USES", defaults.switch_on_uses);
        let max_retries = env_parse("MAX_RETRIES", defaults.max_retries);
        let retry_delay_ms = env_parse("RETRY_DELAY", defaults.retry_delay_ms);

        let immediate_switch_status_codes = std::env::var("IMMEDIATE_SWITCH_STATUS_CODES")
            .map(|raw| parse_status_codes(&raw, defaults.immediate_switch_status_codes.clone()))
            .unwrap_or(defaults.immediate_switch_status_codes);

        let api_keys = match std::env::var("API_KEYS") {
            Ok(raw) => {
                let keys = parse_api_keys(&raw);
                if keys.is_empty() {
                    tracing::warn!("API_KEYS set but empty, using default key");
                    defaults.api_keys
                } else {
                    keys
                }
            }
            Err(_) => {
                tracing::warn!("API_KEYS not set, using default key \"123456\"");
                defaults.api_keys
            }
        };

        let initial_auth_index = env_parse("INITIAL_AUTH_INDEX", defaults.initial_auth_index);

        let camoufox_executable_path = std::env::var("CAMOUFOX_EXECUTABLE_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let auth_dir = std::env::var("AUTH_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.auth_dir);

        let browser_ready_timeout_secs =
            env_parse("BROWSER_READY_TIMEOUT", defaults.browser_ready_timeout_secs);

        Self {
            host,
            http_port,
            ws_port,
            streaming_mode,
            failure_threshold,
            switch_on_uses,
            max_retries,
            retry_delay_ms,
            immediate_switch_status_codes,
            api_keys,
            initial_auth_index,
            camoufox_executable_path,
            auth_dir,
            browser_ready_timeout_secs,
        }
    }

    /// Bind address for the public HTTP API.
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }

    /// Bind address for the relay WebSocket listener.
    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.host, self.ws_port)
    }
}
