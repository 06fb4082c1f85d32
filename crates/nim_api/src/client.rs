use std::future::Future;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};

use crate::config::NimApiConfig;
use crate::error::{parse_error_message, status_error, NimApiError};
use crate::events::{FinishReason, NimStreamEvent};
use crate::headers::build_headers;
use crate::payload::{ChatCompletionRequest, ModelList};
use crate::retry::{is_auth_failure, is_retryable_http_error, retry_delay_ms, MAX_RETRIES};
use crate::sse::SseStreamParser;
use crate::url::{normalize_chat_completions_url, normalize_models_url};

/// Optional cancellation signal shared across request and stream loops.
pub type CancellationSignal = Arc<AtomicBool>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct NimApiClient {
    http: Client,
    config: NimApiConfig,
}

#[derive(Debug, Clone)]
pub struct StreamResult {
    pub events: Vec<NimStreamEvent>,
    pub finish_reason: Option<FinishReason>,
}

impl StreamResult {
    /// Concatenated content deltas.
    pub fn text(&self) -> String {
        self.events
            .iter()
            .filter_map(|event| match event {
                NimStreamEvent::ContentDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl NimApiClient {
    pub fn new(config: NimApiConfig) -> Result<Self, NimApiError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(NimApiError::from)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &NimApiConfig {
        &self.config
    }

    pub fn normalized_endpoint(&self) -> String {
        normalize_chat_completions_url(&self.config.base_url)
    }

    pub fn build_headers(&self, user_agent: Option<&str>) -> Result<HeaderMap, NimApiError> {
        let headers = build_headers(&self.config, user_agent)?;
        let mut out = HeaderMap::new();
        for (key, value) in headers {
            out.insert(
                HeaderName::from_bytes(key.as_bytes())
                    .map_err(|_| NimApiError::InvalidHeader(format!("invalid header key: {key}")))?,
                HeaderValue::from_str(&value).map_err(|_| {
                    NimApiError::InvalidHeader(format!("invalid header value for {key}"))
                })?,
            );
        }
        Ok(out)
    }

    pub fn build_request(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::RequestBuilder, NimApiError> {
        validate_request_payload(request)?;

        let headers = self.build_headers(self.config.user_agent.as_deref())?;
        let mut payload = request.clone();
        payload.stream = true;
        Ok(self
            .http
            .post(self.normalized_endpoint())
            .headers(headers)
            .json(&payload))
    }

    pub fn build_models_request(&self) -> Result<reqwest::RequestBuilder, NimApiError> {
        let headers = self.build_headers(self.config.user_agent.as_deref())?;
        Ok(self
            .http
            .get(normalize_models_url(&self.config.base_url))
            .headers(headers))
    }

    /// Lists the model ids the endpoint serves, sorted. Not retried: callers
    /// use it as a connectivity and credential check.
    pub async fn list_models(
        &self,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Vec<String>, NimApiError> {
        let response = await_or_cancel(self.build_models_request()?.send(), cancellation)
            .await?
            .map_err(NimApiError::from)?;
        let status = response.status();
        let body = await_or_cancel(response.text(), cancellation)
            .await?
            .map_err(NimApiError::from)?;
        if !status.is_success() {
            return Err(status_error(status, parse_error_message(status, &body)));
        }

        let models = serde_json::from_str::<ModelList>(&body)?;
        Ok(models.into_ids())
    }

    pub async fn send_with_retry(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, NimApiError> {
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if is_cancelled(cancellation) {
                return Err(NimApiError::Cancelled);
            }

            let response = self.build_request(request)?.send();
            let response = await_or_cancel(response, cancellation)
                .await?
                .map_err(NimApiError::from);

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    last_status = Some(status);
                    let body = await_or_cancel(response.text(), cancellation)
                        .await?
                        .unwrap_or_default();
                    let message = parse_error_message(status, &body);
                    last_error = Some(message.clone());

                    let retryable = !is_auth_failure(status.as_u16())
                        && is_retryable_http_error(status.as_u16(), &body);
                    if attempt < MAX_RETRIES && retryable {
                        tracing::warn!(
                            status = status.as_u16(),
                            attempt,
                            "retrying chat completion request"
                        );
                        await_or_cancel(tokio::time::sleep(retry_delay_ms(attempt)), cancellation)
                            .await?;
                        continue;
                    }

                    return Err(status_error(status, message));
                }
                Err(error) => {
                    let message = error.to_string();
                    last_error = Some(message);
                    if attempt < MAX_RETRIES {
                        tracing::warn!(attempt, error = ?last_error, "retrying after transport error");
                        await_or_cancel(tokio::time::sleep(retry_delay_ms(attempt)), cancellation)
                            .await?;
                        continue;
                    }
                    return Err(NimApiError::RetryExhausted {
                        status: last_status,
                        last_error,
                    });
                }
            }
        }

        Err(NimApiError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }

    /// Streams one completion, handing each normalized event to `on_event` as
    /// it arrives. Returns the finish reason reported by the model.
    pub async fn stream_with_handler<F>(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
        mut on_event: F,
    ) -> Result<Option<FinishReason>, NimApiError>
    where
        F: FnMut(NimStreamEvent),
    {
        let response = self.send_with_retry(request, cancellation).await?;
        let mut bytes = response.bytes_stream();
        let mut parser = SseStreamParser::default();
        let mut terminal = StreamTerminal::default();

        loop {
            let Some(chunk) = await_or_cancel(bytes.next(), cancellation).await? else {
                break;
            };
            if is_cancelled(cancellation) {
                return Err(NimApiError::Cancelled);
            }
            let chunk = chunk.map_err(NimApiError::from)?;
            for event in parser.feed(&chunk) {
                process_stream_event(event, &mut terminal, &mut on_event)?;
            }
            if terminal.done {
                break;
            }
        }

        if is_cancelled(cancellation) {
            return Err(NimApiError::Cancelled);
        }

        if terminal.finish_reason.is_none() && !terminal.done {
            return Err(NimApiError::Truncated);
        }

        Ok(terminal.finish_reason)
    }

    pub async fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<StreamResult, NimApiError> {
        let mut events = Vec::new();
        let finish_reason = self
            .stream_with_handler(request, cancellation, |event| {
                events.push(event);
            })
            .await?;

        Ok(StreamResult {
            events,
            finish_reason,
        })
    }
}

#[derive(Debug, Default)]
struct StreamTerminal {
    finish_reason: Option<FinishReason>,
    done: bool,
}

fn validate_request_payload(request: &ChatCompletionRequest) -> Result<(), NimApiError> {
    if request.model.trim().is_empty() {
        return Err(NimApiError::InvalidRequestPayload(
            "'model' must not be empty".to_owned(),
        ));
    }
    if request.messages.is_empty() {
        return Err(NimApiError::InvalidRequestPayload(
            "'messages' must contain at least one message".to_owned(),
        ));
    }
    Ok(())
}

fn process_stream_event<F>(
    event: NimStreamEvent,
    terminal: &mut StreamTerminal,
    on_event: &mut F,
) -> Result<(), NimApiError>
where
    F: FnMut(NimStreamEvent),
{
    match &event {
        NimStreamEvent::Error { code, message } => {
            return Err(NimApiError::StreamFailed {
                code: code.clone(),
                message: message
                    .clone()
                    .or_else(|| code.clone())
                    .unwrap_or_else(|| "model endpoint reported an error".to_owned()),
            });
        }
        NimStreamEvent::Finished { reason } => terminal.finish_reason = Some(reason.clone()),
        NimStreamEvent::Done => terminal.done = true,
        NimStreamEvent::ContentDelta { .. } => {}
    }

    on_event(event);
    Ok(())
}

fn is_cancelled(cancel: Option<&CancellationSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

async fn await_or_cancel<F>(
    future: F,
    cancellation: Option<&CancellationSignal>,
) -> Result<F::Output, NimApiError>
where
    F: Future,
{
    if cancellation.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancellation) {
            return Err(NimApiError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancellation) {
                return Err(NimApiError::Cancelled);
            }
            return Ok(output);
        }
    }
}
