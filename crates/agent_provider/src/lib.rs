//! Minimal provider-agnostic contract for one streamed model completion.
//!
//! This crate defines only the request/response envelope and the lifecycle
//! events a provider emits while streaming. It excludes transport details,
//! wire payloads, and everything the agent does with the completed text.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier for one completion request.
pub type RequestId = u64;

/// Shared cancellation flag for a request.
pub type CancelSignal = Arc<AtomicBool>;

/// Creates a fresh, unset cancellation flag.
#[must_use]
pub fn cancel_signal() -> CancelSignal {
    Arc::new(AtomicBool::new(false))
}

/// Returns true once the flag has been raised.
#[must_use]
pub fn is_cancelled(cancel: &CancelSignal) -> bool {
    cancel.load(Ordering::SeqCst)
}

/// Error returned while constructing/configuring a provider before any request starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInitError {
    message: String,
}

impl ProviderInitError {
    /// Creates a new provider initialization error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the underlying error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ProviderInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ProviderInitError {}

impl From<String> for ProviderInitError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProviderInitError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Speaker of one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Provider-neutral model-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Input required to start one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub request_id: RequestId,
    pub messages: Vec<ChatMessage>,
    /// Overrides the provider's selected model for this request only.
    pub model: Option<String>,
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    #[must_use]
    pub fn new(request_id: RequestId, messages: Vec<ChatMessage>) -> Self {
        Self {
            request_id,
            messages,
            model: None,
            temperature: None,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Declared schema of one host tool, sent to the model so its proposals can be
/// checked against it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Provider-emitted lifecycle event for a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    Started { request_id: RequestId },
    Chunk { request_id: RequestId, text: String },
    Finished { request_id: RequestId },
    Failed { request_id: RequestId, error: String },
    Cancelled { request_id: RequestId },
}

impl CompletionEvent {
    /// Returns the request identifier associated with this event.
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Started { request_id }
            | Self::Chunk { request_id, .. }
            | Self::Finished { request_id }
            | Self::Failed { request_id, .. }
            | Self::Cancelled { request_id } => *request_id,
        }
    }

    /// Returns true when this event terminates the request lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

/// Immutable metadata describing a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_id: String,
    pub model_id: String,
}

/// Provider interface for executing one completion request.
pub trait CompletionProvider: Send + Sync + 'static {
    /// Returns provider/model identity metadata.
    fn profile(&self) -> ProviderProfile;

    /// Switches the default model for future requests.
    ///
    /// Providers may return an error when model selection is unsupported.
    fn select_model(&self, model_id: &str) -> Result<ProviderProfile, String> {
        let _ = model_id;
        Err("Model selection is not supported by this provider".to_string())
    }

    /// Model ids this provider can serve, sorted.
    ///
    /// Providers without a catalogue report only the active model.
    fn list_models(&self, cancel: CancelSignal) -> Result<Vec<String>, String> {
        let _ = cancel;
        Ok(vec![self.profile().model_id])
    }

    /// Executes a request and emits lifecycle events in provider order.
    ///
    /// Exactly one terminal event is expected per request. Returning `Err`
    /// without a terminal event is treated as a failure by callers.
    fn complete(
        &self,
        req: CompletionRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(CompletionEvent),
    ) -> Result<(), String>;
}

/// Why a collected completion produced no usable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    Failed(String),
    Cancelled,
    MissingTerminal,
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(message) => write!(f, "completion failed: {message}"),
            Self::Cancelled => f.write_str("completion was cancelled"),
            Self::MissingTerminal => f.write_str("provider exited without terminal event"),
        }
    }
}

impl std::error::Error for CompletionError {}

/// Runs one request to completion, forwarding each chunk to `on_chunk` and
/// returning the concatenated text.
pub fn collect_completion(
    provider: &dyn CompletionProvider,
    req: CompletionRequest,
    cancel: CancelSignal,
    on_chunk: &mut dyn FnMut(&str),
) -> Result<String, CompletionError> {
    let request_id = req.request_id;
    let mut text = String::new();
    let mut terminal: Option<Result<(), CompletionError>> = None;

    let outcome = provider.complete(req, cancel, &mut |event| {
        if event.request_id() != request_id || terminal.is_some() {
            return;
        }

        match event {
            CompletionEvent::Started { .. } => {}
            CompletionEvent::Chunk { text: chunk, .. } => {
                on_chunk(&chunk);
                text.push_str(&chunk);
            }
            CompletionEvent::Finished { .. } => terminal = Some(Ok(())),
            CompletionEvent::Failed { error, .. } => {
                terminal = Some(Err(CompletionError::Failed(error)));
            }
            CompletionEvent::Cancelled { .. } => terminal = Some(Err(CompletionError::Cancelled)),
        }
    });

    match (terminal, outcome) {
        (Some(Ok(())), _) => Ok(text),
        (Some(Err(error)), _) => Err(error),
        (None, Err(error)) => Err(CompletionError::Failed(error)),
        (None, Ok(())) => Err(CompletionError::MissingTerminal),
    }
}
