//! Dialect translation - OpenAI ⇄ Google payload conversion
//!
//! Clients may speak either surface. OpenAI `chat/completions` requests are
//! rewritten into Google `generateContent` calls before they reach the
//! relay, and Google responses are rewritten back on the way out, in both
//! streaming and buffered form.
//!
//! ```text
//! Client request (OpenAI)
//!     ↓ request::translate_chat_request
//! Google generateContent / streamGenerateContent (over the relay)
//!     ↓ response::translate_stream_chunk / translate_buffered
//! Client response (OpenAI)
//! ```

pub mod request;
pub mod response;

pub use request::{redirect_model, translate_chat_request, TranslateOptions, TranslatedChat};
