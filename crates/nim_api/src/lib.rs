//! Transport-only client for OpenAI-compatible chat-completion endpoints
//! (NVIDIA NIM by default).
//!
//! This crate owns request building, SSE parsing, retry policy and error-body
//! decoding. It contains no planning or tool logic and no terminal coupling.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod sse;
pub mod url;

pub use client::{CancellationSignal, NimApiClient, StreamResult};
pub use config::NimApiConfig;
pub use error::NimApiError;
pub use events::{FinishReason, NimStreamEvent};
pub use payload::{ChatCompletionRequest, ModelEntry, ModelList, WireMessage};
pub use sse::SseStreamParser;
pub use url::{normalize_chat_completions_url, normalize_models_url};
