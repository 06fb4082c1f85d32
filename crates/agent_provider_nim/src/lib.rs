//! NIM-backed implementation of the shared `agent_provider` contract.
//!
//! This adapter translates `nim_api` stream semantics into the
//! `CompletionEvent` lifecycle expected by `coding_agent`. Content deltas are
//! forwarded as they arrive so chat replies render token by token.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agent_provider::{
    CancelSignal, CompletionEvent, CompletionProvider, CompletionRequest, ProviderInitError,
    ProviderProfile, RequestId,
};
use nim_api::{
    ChatCompletionRequest, FinishReason, NimApiClient, NimApiConfig, NimApiError,
    NimStreamEvent, WireMessage,
};

/// Stable provider identifier used by `coding_agent` startup selection.
pub const NIM_PROVIDER_ID: &str = "nim";

/// Model used when the configuration names none.
pub const DEFAULT_NIM_MODEL: &str = "meta/llama-3.1-70b-instruct";

/// Runtime configuration for the NIM provider.
#[derive(Debug, Clone, PartialEq)]
pub struct NimProviderConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub timeout: Option<Duration>,
}

impl NimProviderConfig {
    #[must_use]
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
            temperature: None,
            max_tokens: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn to_nim_api_config(&self) -> NimApiConfig {
        let mut config = NimApiConfig::new(self.api_key.clone());

        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url.clone());
        }

        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }

        config
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Sampling {
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
}

trait StreamClient: Send + Sync {
    fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: &CancelSignal,
        on_event: &mut dyn FnMut(NimStreamEvent),
    ) -> Result<Option<FinishReason>, NimApiError>;

    fn list_models(&self, cancel: &CancelSignal) -> Result<Vec<String>, NimApiError>;
}

#[derive(Debug)]
struct DefaultStreamClient {
    client: NimApiClient,
}

impl StreamClient for DefaultStreamClient {
    fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: &CancelSignal,
        on_event: &mut dyn FnMut(NimStreamEvent),
    ) -> Result<Option<FinishReason>, NimApiError> {
        current_thread_runtime()?.block_on(
            self.client
                .stream_with_handler(request, Some(cancel), |event| on_event(event)),
        )
    }

    fn list_models(&self, cancel: &CancelSignal) -> Result<Vec<String>, NimApiError> {
        current_thread_runtime()?.block_on(self.client.list_models(Some(cancel)))
    }
}

fn current_thread_runtime() -> Result<tokio::runtime::Runtime, NimApiError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|error| NimApiError::Runtime(format!("failed to initialize tokio runtime: {error}")))
}

/// `CompletionProvider` adapter backed by `nim_api` transport primitives.
pub struct NimProvider {
    sampling: Mutex<Sampling>,
    stream_client: Arc<dyn StreamClient>,
}

impl NimProvider {
    /// Creates a provider using real HTTP transport.
    pub fn new(config: NimProviderConfig) -> Result<Self, ProviderInitError> {
        if config.api_key.trim().is_empty() {
            return Err(ProviderInitError::new(
                "NVIDIA API key is not configured; set NVIDIA_API_KEY or api_key in the config file",
            ));
        }

        let client = NimApiClient::new(config.to_nim_api_config()).map_err(map_init_error)?;
        Ok(Self {
            sampling: Mutex::new(sampling_from(&config)),
            stream_client: Arc::new(DefaultStreamClient { client }),
        })
    }

    fn build_request(&self, req: &CompletionRequest) -> ChatCompletionRequest {
        let sampling = lock_unpoisoned(&self.sampling).clone();
        let model = req
            .model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map_or(sampling.model, ToString::to_string);

        let messages = req
            .messages
            .iter()
            .map(|message| WireMessage::new(message.role.as_str(), message.content.clone()))
            .collect();

        let mut request = ChatCompletionRequest::new(model, messages);
        request.temperature = req.temperature.or(sampling.temperature);
        request.max_tokens = sampling.max_tokens;
        request
    }

    fn emit_terminal_event(
        request_id: RequestId,
        finish_reason: Option<FinishReason>,
        emit: &mut dyn FnMut(CompletionEvent),
    ) {
        match finish_reason {
            None | Some(FinishReason::Stop) | Some(FinishReason::ToolCalls) => {
                emit(CompletionEvent::Finished { request_id });
            }
            Some(FinishReason::Length) => {
                tracing::warn!(request_id, "completion stopped at the max_tokens limit");
                emit(CompletionEvent::Finished { request_id });
            }
            Some(FinishReason::ContentFilter) => emit(CompletionEvent::Failed {
                request_id,
                error: "response was blocked by the endpoint's content filter".to_string(),
            }),
            Some(FinishReason::Other(reason)) => {
                tracing::debug!(request_id, reason = %reason, "unrecognized finish reason");
                emit(CompletionEvent::Finished { request_id });
            }
        }
    }

    #[cfg(test)]
    fn with_stream_client_for_tests(model: &str, stream_client: Arc<dyn StreamClient>) -> Self {
        Self {
            sampling: Mutex::new(sampling_from(&NimProviderConfig::new("test-key", model))),
            stream_client,
        }
    }
}

impl CompletionProvider for NimProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: NIM_PROVIDER_ID.to_string(),
            model_id: lock_unpoisoned(&self.sampling).model.clone(),
        }
    }

    fn select_model(&self, model_id: &str) -> Result<ProviderProfile, String> {
        let trimmed = model_id.trim();
        if trimmed.is_empty() {
            return Err("Model id must not be empty".to_string());
        }
        lock_unpoisoned(&self.sampling).model = trimmed.to_string();
        Ok(self.profile())
    }

    fn list_models(&self, cancel: CancelSignal) -> Result<Vec<String>, String> {
        self.stream_client
            .list_models(&cancel)
            .map_err(|error| format!("model listing failed: {error}"))
    }

    fn complete(
        &self,
        req: CompletionRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(CompletionEvent),
    ) -> Result<(), String> {
        let request_id = req.request_id;

        emit(CompletionEvent::Started { request_id });

        if cancel.load(Ordering::Acquire) {
            emit(CompletionEvent::Cancelled { request_id });
            return Ok(());
        }

        let request = self.build_request(&req);
        tracing::debug!(
            request_id,
            model = %request.model,
            messages = request.messages.len(),
            "starting chat completion"
        );

        let outcome = self.stream_client.stream(&request, &cancel, &mut |event| {
            if let NimStreamEvent::ContentDelta { delta } = event {
                emit(CompletionEvent::Chunk {
                    request_id,
                    text: delta,
                });
            }
        });

        match outcome {
            Ok(finish_reason) => Self::emit_terminal_event(request_id, finish_reason, emit),
            Err(NimApiError::Cancelled) => emit(CompletionEvent::Cancelled { request_id }),
            Err(error) => emit(CompletionEvent::Failed {
                request_id,
                error: format!("model request failed: {error}"),
            }),
        }

        Ok(())
    }
}

fn sampling_from(config: &NimProviderConfig) -> Sampling {
    let model = config.model.trim();
    Sampling {
        model: if model.is_empty() {
            DEFAULT_NIM_MODEL.to_string()
        } else {
            model.to_string()
        },
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    }
}

fn map_init_error(error: NimApiError) -> ProviderInitError {
    ProviderInitError::new(format!("Failed to initialize nim provider: {error}"))
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
