//! Proxy state types and shared coordination structures

use crate::browser::Orchestrator;
use crate::config::{Config, StreamingMode};
use crate::credentials::CredentialStore;
use crate::logging::LogBuffer;
use crate::relay::{RelayChannel, RequestMultiplexer};
use crate::rotation::RotationController;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Toggles the admin surface can flip at runtime.
pub struct RuntimeFlags {
    streaming_mode: Mutex<StreamingMode>,
    /// Ask for thinking parts on translated OpenAI requests
    pub openai_reasoning: AtomicBool,
    /// Inject thinkingConfig into native Google generative requests
    pub native_reasoning: AtomicBool,
    /// Substitute gemini-2.5-pro with gemini-3-pro-preview
    pub redirect_25_to_30: AtomicBool,
    /// Resume attempts the relay may make; 0 disables resume
    pub resume_limit: AtomicU32,
}

impl RuntimeFlags {
    pub fn new(mode: StreamingMode) -> Self {
        Self {
            streaming_mode: Mutex::new(mode),
            openai_reasoning: AtomicBool::new(false),
            native_reasoning: AtomicBool::new(false),
            redirect_25_to_30: AtomicBool::new(false),
            resume_limit: AtomicU32::new(0),
        }
    }

    pub fn streaming_mode(&self) -> StreamingMode {
        *self.streaming_mode.lock().unwrap()
    }

    pub fn set_streaming_mode(&self, mode: StreamingMode) {
        *self.streaming_mode.lock().unwrap() = mode;
    }

    pub fn resume_enabled(&self) -> bool {
        self.resume_limit.load(Ordering::Relaxed) > 0
    }
}

/// Shared state for the proxy server
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<Config>,
    pub store: Arc<CredentialStore>,
    pub channel: Arc<RelayChannel>,
    pub mux: Arc<RequestMultiplexer>,
    pub rotation: Arc<RotationController>,
    pub browser: Arc<dyn Orchestrator>,
    pub flags: Arc<RuntimeFlags>,
    /// Recent log lines for the status endpoint
    pub log_buffer: LogBuffer,
    /// Live admin session tokens
    pub admin_sessions: Arc<Mutex<HashSet<String>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_twice_restores_prior_value() {
        let flags = RuntimeFlags::new(StreamingMode::Real);
        let before = flags.native_reasoning.load(Ordering::Relaxed);
        flags.native_reasoning.fetch_xor(true, Ordering::Relaxed);
        flags.native_reasoning.fetch_xor(true, Ordering::Relaxed);
        assert_eq!(flags.native_reasoning.load(Ordering::Relaxed), before);
    }

    #[test]
    fn test_resume_enabled_tracks_limit() {
        let flags = RuntimeFlags::new(StreamingMode::Real);
        assert!(!flags.resume_enabled());
        flags.resume_limit.store(2, Ordering::Relaxed);
        assert!(flags.resume_enabled());
        flags.resume_limit.store(0, Ordering::Relaxed);
        assert!(!flags.resume_enabled());
    }
}
