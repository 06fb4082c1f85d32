//! `nv models`: list the endpoint's models and switch the default one.

use std::fmt::Write as _;

use agent_provider::{CancelSignal, CompletionProvider, ProviderProfile};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("{0}")]
    Provider(String),
    #[error("model `{model}` is not served by this endpoint; `nv models list` shows the choices")]
    Unknown { model: String },
}

/// Numbered list with the current model starred.
#[must_use]
pub fn render_model_list(models: &[String], current: &str, base_url: &str) -> String {
    let mut text = String::new();
    for (index, model) in models.iter().enumerate() {
        let marker = if model == current { '*' } else { ' ' };
        let _ = writeln!(text, "{marker} {:>3}. {model}", index + 1);
    }
    let _ = writeln!(text, "{} model(s) available on {base_url}", models.len());
    text
}

/// Makes `model` the provider's default after checking the endpoint serves it.
pub fn switch_model(
    provider: &dyn CompletionProvider,
    model: &str,
    cancel: CancelSignal,
) -> Result<ProviderProfile, ModelError> {
    let model = model.trim();
    let available = provider.list_models(cancel).map_err(ModelError::Provider)?;
    if !available.iter().any(|candidate| candidate == model) {
        return Err(ModelError::Unknown {
            model: model.to_string(),
        });
    }
    provider.select_model(model).map_err(ModelError::Provider)
}

#[cfg(test)]
mod tests {
    use agent_provider::cancel_signal;
    use agent_provider_mock::ScriptedProvider;

    use super::*;

    #[test]
    fn list_marks_the_current_model() {
        let models = vec!["a/one".to_string(), "b/two".to_string()];

        let text = render_model_list(&models, "b/two", "https://example.test/v1");

        assert_eq!(
            text,
            "    1. a/one\n*   2. b/two\n2 model(s) available on https://example.test/v1\n"
        );
    }

    #[test]
    fn switching_to_a_served_model_updates_the_profile() {
        let provider = ScriptedProvider::new(Vec::new());

        let profile = switch_model(&provider, " mock ", cancel_signal()).expect("switch");

        assert_eq!(profile.model_id, "mock");
    }

    #[test]
    fn unknown_model_is_refused() {
        let provider = ScriptedProvider::new(Vec::new());

        let error = switch_model(&provider, "other/model", cancel_signal()).expect_err("unknown");

        assert_eq!(
            error,
            ModelError::Unknown {
                model: "other/model".to_string()
            }
        );
        assert_eq!(provider.profile().model_id, "mock");
    }
}
