//! `nv doctor`: environment health checks.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::{AgentConfig, API_KEY_ENV_VAR};

pub const API_KEY_PREFIX: &str = "nvapi-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    /// Worth fixing, but `nv` still works.
    Warn,
    Fail,
}

impl CheckStatus {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name,
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoctorReport {
    pub checks: Vec<Check>,
}

impl DoctorReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.checks
            .iter()
            .all(|check| check.status != CheckStatus::Fail)
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut text = String::new();
        for check in &self.checks {
            let _ = writeln!(
                text,
                "  {:<4} {}: {}",
                check.status.label(),
                check.name,
                check.detail
            );
        }
        text.push_str(if self.passed() {
            "All checks passed!\n"
        } else {
            "Some checks failed.\n"
        });
        text
    }

    fn push(&mut self, check: Check) {
        tracing::debug!(name = check.name, status = check.status.label(), detail = %check.detail, "doctor check");
        self.checks.push(check);
    }
}

/// Runs every check. `connect` lists the models the configured provider
/// serves; it is only called once credentials look usable.
pub fn run_checks(
    config_path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
    cwd: &Path,
    connect: impl FnOnce(&AgentConfig) -> Result<Vec<String>, String>,
) -> DoctorReport {
    let mut report = DoctorReport::default();

    let config = match AgentConfig::load_with(config_path, env) {
        Ok(config) => {
            let detail = match config_path {
                Some(path) if path.is_file() => format!("loaded {}", path.display()),
                Some(path) => format!("{} not found; using defaults", path.display()),
                None => "no config path; using defaults".to_string(),
            };
            report.push(Check::new("config", CheckStatus::Ok, detail));
            config
        }
        Err(error) => {
            report.push(Check::new("config", CheckStatus::Fail, error.to_string()));
            return report;
        }
    };

    let credentials_ok = if config.provider == "nim" {
        check_api_key(&config, &mut report)
    } else {
        report.push(Check::new(
            "api key",
            CheckStatus::Ok,
            format!("not needed by provider `{}`", config.provider),
        ));
        true
    };

    let session_root = config.session_root(cwd);
    report.push(match writable(&session_root) {
        Ok(()) => Check::new("sessions", CheckStatus::Ok, session_root.display().to_string()),
        Err(error) => Check::new(
            "sessions",
            CheckStatus::Fail,
            format!("{} is not writable: {error}", session_root.display()),
        ),
    });

    report.push(match tool_version("bash") {
        Some(version) => Check::new("shell", CheckStatus::Ok, version),
        None => Check::new("shell", CheckStatus::Fail, "bash not found on PATH"),
    });
    report.push(match tool_version("git") {
        Some(version) => Check::new("git", CheckStatus::Ok, version),
        None => Check::new(
            "git",
            CheckStatus::Warn,
            "git not found; plans are made without repository status",
        ),
    });

    if credentials_ok {
        report.push(match connect(&config) {
            Ok(models) => Check::new(
                "connectivity",
                CheckStatus::Ok,
                format!("{} model(s) available on {}", models.len(), config.base_url),
            ),
            Err(error) => Check::new("connectivity", CheckStatus::Fail, error),
        });
    }
    report
}

fn check_api_key(config: &AgentConfig, report: &mut DoctorReport) -> bool {
    let Some(key) = config.api_key.as_deref().filter(|key| !key.trim().is_empty()) else {
        report.push(Check::new(
            "api key",
            CheckStatus::Fail,
            format!("not configured; set {API_KEY_ENV_VAR} or api_key in the config file"),
        ));
        return false;
    };
    if key.starts_with(API_KEY_PREFIX) {
        report.push(Check::new("api key", CheckStatus::Ok, "configured"));
    } else {
        report.push(Check::new(
            "api key",
            CheckStatus::Warn,
            format!("does not start with `{API_KEY_PREFIX}`"),
        ));
    }
    true
}

fn writable(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    tempfile::NamedTempFile::new_in(dir).map(drop)
}

/// First line of `<program> --version`, if it runs.
fn tool_version(program: &str) -> Option<String> {
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .ok()
        .filter(|output| output.status.success())?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::PROVIDER_ENV_VAR;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    fn status_of(report: &DoctorReport, name: &str) -> Option<CheckStatus> {
        report
            .checks
            .iter()
            .find(|check| check.name == name)
            .map(|check| check.status)
    }

    #[test]
    fn missing_key_fails_and_skips_connectivity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = run_checks(None, env_of(&[]), dir.path(), |_| {
            panic!("must not connect without a key")
        });

        assert_eq!(status_of(&report, "api key"), Some(CheckStatus::Fail));
        assert_eq!(status_of(&report, "connectivity"), None);
        assert!(!report.passed());
        assert!(report.render().ends_with("Some checks failed.\n"));
    }

    #[test]
    fn unusual_key_prefix_is_only_a_warning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = run_checks(
            None,
            env_of(&[(API_KEY_ENV_VAR, "sk-123")]),
            dir.path(),
            |_| Ok(vec!["a".to_string(), "b".to_string()]),
        );

        assert_eq!(status_of(&report, "api key"), Some(CheckStatus::Warn));
        let connectivity = report
            .checks
            .iter()
            .find(|check| check.name == "connectivity")
            .expect("connectivity checked");
        assert!(connectivity.detail.starts_with("2 model(s) available on "));
    }

    #[test]
    fn connection_failure_fails_the_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = run_checks(
            None,
            env_of(&[(API_KEY_ENV_VAR, "nvapi-abc")]),
            dir.path(),
            |_| Err("401 unauthorized".to_string()),
        );

        assert_eq!(status_of(&report, "api key"), Some(CheckStatus::Ok));
        assert_eq!(status_of(&report, "connectivity"), Some(CheckStatus::Fail));
        assert!(report.render().contains("FAIL connectivity: 401 unauthorized"));
    }

    #[test]
    fn unreadable_config_stops_early() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, "modle: typo\n").expect("write config");

        let report = run_checks(Some(&path), env_of(&[]), dir.path(), |_| Ok(Vec::new()));

        assert_eq!(report.checks.len(), 1);
        assert_eq!(status_of(&report, "config"), Some(CheckStatus::Fail));
    }

    #[test]
    fn mock_provider_needs_no_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = run_checks(
            None,
            env_of(&[(PROVIDER_ENV_VAR, "mock")]),
            dir.path(),
            |config| Ok(vec![config.model.clone()]),
        );

        assert_eq!(status_of(&report, "api key"), Some(CheckStatus::Ok));
        assert_eq!(status_of(&report, "connectivity"), Some(CheckStatus::Ok));
        assert_eq!(status_of(&report, "sessions"), Some(CheckStatus::Ok));
    }
}
