/// Default base URL for NVIDIA-hosted model endpoints.
pub const DEFAULT_NIM_BASE_URL: &str = "https://integrate.api.nvidia.com/v1";

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
const MODELS_PATH: &str = "/models";

/// Normalize a base URL to the chat-completions endpoint.
///
/// A URL already ending in `/chat/completions` is kept; anything else gets the
/// path appended. Blank input falls back to [`DEFAULT_NIM_BASE_URL`].
pub fn normalize_chat_completions_url(input: &str) -> String {
    let base = if input.trim().is_empty() {
        DEFAULT_NIM_BASE_URL
    } else {
        input.trim()
    };

    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with(CHAT_COMPLETIONS_PATH) {
        return trimmed.to_string();
    }
    format!("{trimmed}{CHAT_COMPLETIONS_PATH}")
}

/// Normalize a base URL to the model-listing endpoint.
///
/// Accepts the same inputs as [`normalize_chat_completions_url`], so a base
/// configured with the completions path still lists models.
pub fn normalize_models_url(input: &str) -> String {
    let completions = normalize_chat_completions_url(input);
    let base = completions
        .strip_suffix(CHAT_COMPLETIONS_PATH)
        .unwrap_or(&completions);
    format!("{base}{MODELS_PATH}")
}
