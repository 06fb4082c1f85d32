use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one plan step.
///
/// ```text
/// Pending ─┬─> Approved ─┬─> Executed
///          │             └─> Failed
///          ├─> Rejected ───> Skipped
///          └─> Skipped
/// ```
///
/// `Pending -> Skipped` covers steps that never reach the gate: the remainder
/// of a halted or aborted plan, dry runs, and steps with unusable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
    Skipped,
}

impl StepStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Failed | Self::Skipped)
    }

    #[must_use]
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Pending, Self::Skipped)
                | (Self::Approved, Self::Executed)
                | (Self::Approved, Self::Failed)
                | (Self::Rejected, Self::Skipped)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
