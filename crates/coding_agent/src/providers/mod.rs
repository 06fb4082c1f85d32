use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agent_provider::{CompletionProvider, ProviderInitError, RequestId};
use agent_provider_mock::{ScriptedProvider, MOCK_PROVIDER_ID};
use agent_provider_nim::{NimProvider, NimProviderConfig, NIM_PROVIDER_ID};

use crate::config::AgentConfig;

/// Builds the provider named by `config.provider`.
pub fn provider_for_config(
    config: &AgentConfig,
) -> Result<Arc<dyn CompletionProvider>, ProviderInitError> {
    match config.provider.trim() {
        MOCK_PROVIDER_ID => Ok(Arc::new(ScriptedProvider::default())),
        NIM_PROVIDER_ID => {
            let nim = NimProviderConfig::new(
                config.api_key.clone().unwrap_or_default(),
                config.model.clone(),
            )
            .with_base_url(config.base_url.clone())
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens);
            Ok(Arc::new(NimProvider::new(nim)?))
        }
        unknown => Err(ProviderInitError::new(format!(
            "Unsupported provider '{unknown}'. Available providers: {MOCK_PROVIDER_ID}, {NIM_PROVIDER_ID}"
        ))),
    }
}

/// Monotonic request ids for one process.
#[derive(Debug, Default)]
pub struct RequestIds(AtomicU64);

impl RequestIds {
    pub fn next(&self) -> RequestId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}
