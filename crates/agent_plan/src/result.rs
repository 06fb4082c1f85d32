use std::fmt;

use serde::{Deserialize, Serialize};

use crate::plan::StepId;

/// Error taxonomy shared by tools, the diff engine and the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InvalidPath,
    InvalidParameters,
    Conflict,
    Timeout,
    NonZeroExit,
    MalformedDiff,
    HunkMismatch,
    PlanGenerationError,
    Rejected,
    Cancelled,
    Io,
}

impl ErrorKind {
    /// Transient failures are retried once by the executor.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidPath => "invalid_path",
            Self::InvalidParameters => "invalid_parameters",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::NonZeroExit => "non_zero_exit",
            Self::MalformedDiff => "malformed_diff",
            Self::HunkMismatch => "hunk_mismatch",
            Self::PlanGenerationError => "plan_generation_error",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
        }
    }

    /// Maps an I/O failure onto the taxonomy.
    #[must_use]
    pub fn from_io(error: &std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External resource touched by a step. The plan records it; it never owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceRef {
    File { path: String },
    Process { command: String, pid: Option<u32> },
}

/// Outcome of one tool attempt. Retries append a new result with the next
/// `attempt` number instead of replacing the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    pub step_id: StepId,
    pub attempt: u32,
    pub ok: bool,
    pub output: String,
    pub error: Option<ErrorKind>,
    #[serde(default)]
    pub side_effects: Vec<ResourceRef>,
}

impl ToolInvocationResult {
    #[must_use]
    pub fn success(step_id: StepId, output: impl Into<String>) -> Self {
        Self {
            step_id,
            attempt: 1,
            ok: true,
            output: output.into(),
            error: None,
            side_effects: Vec::new(),
        }
    }

    #[must_use]
    pub fn failure(step_id: StepId, error: ErrorKind, output: impl Into<String>) -> Self {
        Self {
            step_id,
            attempt: 1,
            ok: false,
            output: output.into(),
            error: Some(error),
            side_effects: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_side_effect(mut self, resource: ResourceRef) -> Self {
        self.side_effects.push(resource);
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    #[must_use]
    pub fn is_transient_failure(&self) -> bool {
        !self.ok && self.error.is_some_and(ErrorKind::is_transient)
    }
}
