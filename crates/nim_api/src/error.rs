use std::fmt;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Error as JsonError;

use crate::retry::is_auth_failure;

#[derive(Debug)]
pub enum NimApiError {
    MissingApiKey,
    InvalidHeader(String),
    InvalidRequestPayload(String),
    Request(reqwest::Error),
    Status(StatusCode, String),
    Authentication { status: StatusCode, message: String },
    Serde(JsonError),
    RetryExhausted {
        status: Option<StatusCode>,
        last_error: Option<String>,
    },
    StreamFailed {
        code: Option<String>,
        message: String,
    },
    /// The body ended before a finish reason or `[DONE]` arrived.
    Truncated,
    Cancelled,
    Runtime(String),
}

impl NimApiError {
    /// True for failures the user fixes by changing credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::MissingApiKey | Self::Authentication { .. })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: Option<ErrorPayloadValue>,
    detail: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorPayloadValue {
    Fields(ErrorPayloadFields),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct ErrorPayloadFields {
    message: Option<String>,
}

impl fmt::Display for NimApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingApiKey => write!(
                f,
                "API key is required; set NVIDIA_API_KEY or api_key in the config file"
            ),
            Self::InvalidHeader(message) => write!(f, "invalid header: {message}"),
            Self::InvalidRequestPayload(message) => write!(f, "invalid request payload: {message}"),
            Self::Request(error) => write!(f, "request error: {error}"),
            Self::Status(status, message) => write!(f, "HTTP {status} {message}"),
            Self::Authentication { status, message } => write!(
                f,
                "authentication failed (HTTP {}): {message}. Check that NVIDIA_API_KEY is correct and starts with 'nvapi-'",
                status.as_u16()
            ),
            Self::Serde(error) => write!(f, "serialization error: {error}"),
            Self::RetryExhausted { status, last_error } => {
                let status = status
                    .map(|status| status.as_u16().to_string())
                    .unwrap_or_else(|| "n/a".to_owned());
                write!(
                    f,
                    "retry exhausted after max attempts (status: {status}, last_error: {last_error:?})"
                )
            }
            Self::StreamFailed { code, message } => match code {
                Some(code) if !code.trim().is_empty() => {
                    write!(f, "stream failed ({code}): {message}")
                }
                _ => write!(f, "stream failed: {message}"),
            },
            Self::Truncated => write!(f, "stream ended before the model finished"),
            Self::Cancelled => write!(f, "request was cancelled"),
            Self::Runtime(message) => write!(f, "async runtime failure: {message}"),
        }
    }
}

impl std::error::Error for NimApiError {}

impl From<reqwest::Error> for NimApiError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error)
    }
}

impl From<JsonError> for NimApiError {
    fn from(error: JsonError) -> Self {
        Self::Serde(error)
    }
}

/// Extracts a human-readable message from an error response body.
///
/// Understands `{"error": {"message": ...}}`, `{"error": "..."}` and the
/// problem-details shape `{"title": ..., "detail": ...}`.
pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    let fallback = || {
        if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            body.trim().to_string()
        }
    };

    let Ok(parsed) = serde_json::from_str::<ErrorPayload>(body) else {
        return fallback();
    };

    let from_error = parsed.error.and_then(|value| match value {
        ErrorPayloadValue::Fields(fields) => fields.message,
        ErrorPayloadValue::Text(text) => Some(text),
    });

    from_error
        .or(parsed.detail)
        .or(parsed.title)
        .and_then(|message| non_empty(&message))
        .unwrap_or_else(fallback)
}

/// Maps a non-success response onto the error taxonomy.
pub fn status_error(status: StatusCode, message: String) -> NimApiError {
    if is_auth_failure(status.as_u16()) {
        NimApiError::Authentication { status, message }
    } else {
        NimApiError::Status(status, message)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}
