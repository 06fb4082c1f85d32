use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::status::StepStatus;
use crate::tool::ToolKind;

pub type StepId = u32;
pub type TaskId = String;

/// User request as submitted. Never edited after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub text: String,
}

impl Task {
    #[must_use]
    pub fn new(id: impl Into<TaskId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Step as proposed by the planner, before it is numbered.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedStep {
    pub tool: ToolKind,
    pub parameters: Map<String, Value>,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub tool: ToolKind,
    pub parameters: Map<String, Value>,
    pub rationale: String,
    pub status: StepStatus,
}

impl PlanStep {
    /// Returns a string parameter, if present.
    #[must_use]
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition for step {step_id}: {from} -> {to}")]
pub struct TransitionError {
    pub step_id: StepId,
    pub from: StepStatus,
    pub to: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanShapeError {
    #[error("step at position {position} has id {found}; ids must be dense from 0")]
    NonDenseIds { position: usize, found: StepId },
    #[error("plan has more than {max} steps", max = StepId::MAX)]
    TooManySteps,
}

/// Ordered steps for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedPlan")]
pub struct Plan {
    task_id: TaskId,
    summary: String,
    steps: Vec<PlanStep>,
}

#[derive(Deserialize)]
struct UncheckedPlan {
    task_id: TaskId,
    summary: String,
    steps: Vec<PlanStep>,
}

impl TryFrom<UncheckedPlan> for Plan {
    type Error = PlanShapeError;

    fn try_from(raw: UncheckedPlan) -> Result<Self, Self::Error> {
        for (position, step) in raw.steps.iter().enumerate() {
            if usize::try_from(step.id).ok() != Some(position) {
                return Err(PlanShapeError::NonDenseIds {
                    position,
                    found: step.id,
                });
            }
        }

        Ok(Self {
            task_id: raw.task_id,
            summary: raw.summary,
            steps: raw.steps,
        })
    }
}

impl Plan {
    /// Numbers the proposed steps 0..n in the order given. All start `Pending`.
    pub fn new(
        task_id: impl Into<TaskId>,
        summary: impl Into<String>,
        proposed: Vec<ProposedStep>,
    ) -> Result<Self, PlanShapeError> {
        let mut steps = Vec::with_capacity(proposed.len());
        for (position, step) in proposed.into_iter().enumerate() {
            let id = StepId::try_from(position).map_err(|_| PlanShapeError::TooManySteps)?;
            steps.push(PlanStep {
                id,
                tool: step.tool,
                parameters: step.parameters,
                rationale: step.rationale,
                status: StepStatus::Pending,
            });
        }

        Ok(Self {
            task_id: task_id.into(),
            summary: summary.into(),
            steps,
        })
    }

    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    #[must_use]
    pub fn summary(&self) -> &str {
        &self.summary
    }

    #[must_use]
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn step(&self, id: StepId) -> Option<&PlanStep> {
        self.steps.get(usize::try_from(id).ok()?)
    }

    /// Moves one step along a legal edge of the status machine.
    pub fn transition(&mut self, id: StepId, to: StepStatus) -> Result<StepStatus, TransitionError> {
        let Some(step) = usize::try_from(id)
            .ok()
            .and_then(|index| self.steps.get_mut(index))
        else {
            return Err(TransitionError {
                step_id: id,
                from: StepStatus::Pending,
                to,
            });
        };

        let from = step.status;
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                step_id: id,
                from,
                to,
            });
        }

        step.status = to;
        Ok(from)
    }

    /// Ids of steps still `Pending` after `id`, in order.
    #[must_use]
    pub fn pending_after(&self, id: StepId) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|step| step.id > id && step.status == StepStatus::Pending)
            .map(|step| step.id)
            .collect()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.steps.iter().all(|step| step.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::{Plan, PlanShapeError, ProposedStep};
    use crate::{StepStatus, ToolKind};

    fn proposed(tool: ToolKind) -> ProposedStep {
        ProposedStep {
            tool,
            parameters: Map::new(),
            rationale: "because".to_string(),
        }
    }

    #[test]
    fn ids_are_dense_from_zero() {
        let plan = Plan::new(
            "task-1",
            "three steps",
            vec![
                proposed(ToolKind::ReadFile),
                proposed(ToolKind::WriteFile),
                proposed(ToolKind::RunShellCommand),
            ],
        )
        .expect("plan builds");

        let ids = plan.steps().iter().map(|step| step.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(plan
            .steps()
            .iter()
            .all(|step| step.status == StepStatus::Pending));
    }

    #[test]
    fn transition_rejects_illegal_edges_and_leaves_status_alone() {
        let mut plan = Plan::new("t", "s", vec![proposed(ToolKind::ReadFile)]).expect("plan");

        let error = plan
            .transition(0, StepStatus::Executed)
            .expect_err("pending -> executed is illegal");
        assert_eq!(error.from, StepStatus::Pending);
        assert_eq!(plan.steps()[0].status, StepStatus::Pending);

        plan.transition(0, StepStatus::Approved).expect("approve");
        plan.transition(0, StepStatus::Executed).expect("execute");
        assert!(plan.transition(0, StepStatus::Failed).is_err());
        assert!(plan.is_finished());
    }

    #[test]
    fn transition_on_unknown_step_fails() {
        let mut plan = Plan::new("t", "s", Vec::new()).expect("plan");
        assert!(plan.transition(4, StepStatus::Approved).is_err());
    }

    #[test]
    fn deserialize_rejects_non_dense_ids() {
        let value = json!({
            "task_id": "t",
            "summary": "s",
            "steps": [
                {"id": 0, "tool": "read_file", "parameters": {}, "rationale": "", "status": "pending"},
                {"id": 2, "tool": "read_file", "parameters": {}, "rationale": "", "status": "pending"}
            ]
        });

        let error = serde_json::from_value::<Plan>(value).expect_err("gap must fail");
        assert!(error
            .to_string()
            .contains(&PlanShapeError::NonDenseIds { position: 1, found: 2 }.to_string()));
    }

    #[test]
    fn pending_after_lists_remaining_steps() {
        let mut plan = Plan::new(
            "t",
            "s",
            vec![
                proposed(ToolKind::ReadFile),
                proposed(ToolKind::WriteFile),
                proposed(ToolKind::SearchText),
            ],
        )
        .expect("plan");
        plan.transition(0, StepStatus::Rejected).expect("reject");

        assert_eq!(plan.pending_after(0), vec![1, 2]);
    }
}
