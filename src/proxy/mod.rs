// Proxy module - the public HTTP surface
//
// Serves the API-key gated generative endpoints (Google passthrough plus the
// OpenAI chat/completions surface) and the session-cookie gated admin
// surface. Every proxied request rides the relay channel; nothing here
// talks to the upstream directly.

pub mod admin;
pub mod auth;
pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use server::start_proxy;
pub use state::{ProxyState, RuntimeFlags};
