//! Agent configuration.
//!
//! Precedence, highest first: environment variables, the YAML file, built-in
//! defaults. CLI flags are applied on top by the binary for one run only.
//!
//! ```yaml
//! api_key: nvapi-...
//! model: meta/llama-3.1-70b-instruct
//! command_allowlist:
//!   - pytest
//!   - cargo test
//! shell_timeout_sec: 120
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_PATH_ENV_VAR: &str = "CODING_AGENT_CONFIG_PATH";
pub const PROVIDER_ENV_VAR: &str = "CODING_AGENT_PROVIDER";
pub const API_KEY_ENV_VAR: &str = "NVIDIA_API_KEY";
pub const BASE_URL_ENV_VAR: &str = "NVIDIA_BASE_URL";
pub const MODEL_ENV_VAR: &str = "NVIDIA_MODEL";

pub const DEFAULT_BASE_URL: &str = "https://integrate.api.nvidia.com/v1";
pub const DEFAULT_MODEL: &str = "meta/llama-3.1-70b-instruct";
pub const DEFAULT_PROVIDER: &str = "nim";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to update config file {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Defaults to `<cwd>/.agent/sessions`.
    pub session_dir: Option<PathBuf>,
    pub command_allowlist: Vec<String>,
    pub shell_timeout_sec: u64,
    pub max_plan_steps: usize,
    pub provider: String,
    pub dry_run: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            max_tokens: 4096,
            session_dir: None,
            command_allowlist: Vec::new(),
            shell_timeout_sec: 120,
            max_plan_steps: 12,
            provider: DEFAULT_PROVIDER.to_string(),
            dry_run: false,
        }
    }
}

impl AgentConfig {
    /// Loads from `$CODING_AGENT_CONFIG_PATH` or `~/.nvcli/config.yaml`, then
    /// applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let path = config_path(&lookup);
        Self::load_with(path.as_deref(), lookup)
    }

    /// `$CODING_AGENT_CONFIG_PATH`, else `~/.nvcli/config.yaml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        config_path(&|key: &str| std::env::var(key).ok())
    }

    /// Loads from `path` (a missing file yields defaults) and applies the
    /// overrides found by `env`.
    pub fn load_with(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| {
            env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(api_key) = non_empty(API_KEY_ENV_VAR) {
            self.api_key = Some(api_key);
        }
        if let Some(base_url) = non_empty(BASE_URL_ENV_VAR) {
            self.base_url = base_url;
        }
        if let Some(model) = non_empty(MODEL_ENV_VAR) {
            self.model = model;
        }
        if let Some(provider) = non_empty(PROVIDER_ENV_VAR) {
            self.provider = provider;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid(
                "max_tokens must be greater than 0".to_string(),
            ));
        }
        if self.shell_timeout_sec == 0 {
            return Err(ConfigError::Invalid(
                "shell_timeout_sec must be greater than 0".to_string(),
            ));
        }
        if self.max_plan_steps == 0 {
            return Err(ConfigError::Invalid(
                "max_plan_steps must be greater than 0".to_string(),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must not be empty".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_sec)
    }

    /// Session directory for a run started in `cwd`.
    #[must_use]
    pub fn session_root(&self, cwd: &Path) -> PathBuf {
        match &self.session_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => cwd.join(dir),
            None => session_store::session_root(cwd),
        }
    }
}

/// Sets `model` in the file at `path`, creating it if needed. Other keys and
/// their values are kept.
pub fn persist_model(path: &Path, model: &str) -> Result<(), ConfigError> {
    let mut document = match fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => serde_yaml::from_str::<serde_yaml::Mapping>(&text)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
        Ok(_) => serde_yaml::Mapping::new(),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => serde_yaml::Mapping::new(),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    document.insert("model".into(), model.into());

    let text = serde_yaml::to_string(&document).map_err(|source| ConfigError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    let write_error = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    fs::write(path, text).map_err(write_error)?;
    tracing::info!(path = %path.display(), model, "saved default model");
    Ok(())
}

fn config_path(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = env(CONFIG_PATH_ENV_VAR).filter(|value| !value.trim().is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".nvcli").join("config.yaml"))
}
