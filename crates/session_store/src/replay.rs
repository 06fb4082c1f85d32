use std::collections::BTreeMap;

use agent_plan::{Plan, StepId, StepStatus, Task, TaskId, ToolInvocationResult, TransitionError};
use agent_provider::ChatMessage;
use thiserror::Error;

use crate::schema::{SessionEntry, SessionEntryKind, SessionHeader};

/// Why an entry cannot follow the entries before it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayViolation {
    #[error("expected seq {expected}, found {found}")]
    NonMonotonicSeq { expected: u64, found: u64 },
    #[error("task '{task_id}' was already recorded")]
    DuplicateTask { task_id: TaskId },
    #[error("unknown task '{task_id}'")]
    UnknownTask { task_id: TaskId },
    #[error("task '{task_id}' already has a plan")]
    DuplicatePlan { task_id: TaskId },
    #[error("plan belongs to task '{found}', recorded under '{task_id}'")]
    PlanTaskMismatch { task_id: TaskId, found: TaskId },
    #[error("task '{task_id}' has no plan")]
    MissingPlan { task_id: TaskId },
    #[error("task '{task_id}' has no step {step_id}")]
    UnknownStep { task_id: TaskId, step_id: StepId },
    #[error("step {step_id} result has non-terminal status {status}")]
    NonTerminalResult { step_id: StepId, status: StepStatus },
    #[error("step {step_id} has a result for a different step ({found})")]
    ForeignAttempt { step_id: StepId, found: StepId },
    #[error("step {step_id} settled as {status} without any attempt")]
    MissingAttempts { step_id: StepId, status: StepStatus },
    #[error("step {step_id} was skipped but carries {count} attempt(s)")]
    SkippedWithAttempts { step_id: StepId, count: usize },
    #[error("step {step_id} attempt {found} recorded where attempt {expected} belongs")]
    AttemptOutOfSequence {
        step_id: StepId,
        expected: u32,
        found: u32,
    },
    #[error("step {step_id} settled as {status} but its last attempt disagrees")]
    OutcomeMismatch { step_id: StepId, status: StepStatus },
    #[error("step {step_id} may not run before step {earlier} is terminal")]
    OutOfOrderStep { step_id: StepId, earlier: StepId },
    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),
}

/// State rebuilt from a session log.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub created_at: String,
    pub cwd: String,
    pub task_history: Vec<Task>,
    pub plans: BTreeMap<TaskId, Plan>,
    pub results: Vec<ToolInvocationResult>,
    /// The same results grouped by the task whose plan produced them.
    pub task_results: BTreeMap<TaskId, Vec<ToolInvocationResult>>,
    pub chat: Vec<ChatMessage>,
    pub last_seq: u64,
}

impl Session {
    #[must_use]
    pub fn from_header(header: &SessionHeader) -> Self {
        Self {
            id: header.session_id.clone(),
            created_at: header.created_at.clone(),
            cwd: header.cwd.clone(),
            task_history: Vec::new(),
            plans: BTreeMap::new(),
            results: Vec::new(),
            task_results: BTreeMap::new(),
            chat: Vec::new(),
            last_seq: 0,
        }
    }

    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.task_history.iter().find(|task| task.id == task_id)
    }

    #[must_use]
    pub fn results_for(&self, task_id: &str) -> &[ToolInvocationResult] {
        self.task_results.get(task_id).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn latest_task(&self) -> Option<&Task> {
        self.task_history.last()
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.last_seq
    }

    /// Applies one entry. Either the whole entry is applied or, on error,
    /// nothing changes.
    pub fn apply(&mut self, entry: &SessionEntry) -> Result<(), ReplayViolation> {
        let settled = self.prepare(entry)?;
        self.commit(entry, settled);
        Ok(())
    }

    /// Checks `entry` against the current state without changing it. For a
    /// step result, returns the plan as it stands once the step is settled.
    pub(crate) fn prepare(&self, entry: &SessionEntry) -> Result<Option<Plan>, ReplayViolation> {
        let expected = self.last_seq + 1;
        if entry.seq != expected {
            return Err(ReplayViolation::NonMonotonicSeq {
                expected,
                found: entry.seq,
            });
        }

        match &entry.kind {
            SessionEntryKind::Task { task_id, .. } => {
                if self.task(task_id).is_some() {
                    return Err(ReplayViolation::DuplicateTask {
                        task_id: task_id.clone(),
                    });
                }
                Ok(None)
            }
            SessionEntryKind::Plan { task_id, plan } => {
                if self.task(task_id).is_none() {
                    return Err(ReplayViolation::UnknownTask {
                        task_id: task_id.clone(),
                    });
                }
                if plan.task_id() != task_id {
                    return Err(ReplayViolation::PlanTaskMismatch {
                        task_id: task_id.clone(),
                        found: plan.task_id().to_string(),
                    });
                }
                if self.plans.contains_key(task_id) {
                    return Err(ReplayViolation::DuplicatePlan {
                        task_id: task_id.clone(),
                    });
                }
                Ok(None)
            }
            SessionEntryKind::StepResult {
                task_id,
                step_id,
                status,
                rejected,
                attempts,
                ..
            } => self
                .settled_plan(task_id, *step_id, *status, *rejected, attempts)
                .map(Some),
            SessionEntryKind::ChatTurn { .. } => Ok(None),
        }
    }

    /// Folds an entry already accepted by [`Session::prepare`] into the state.
    pub(crate) fn commit(&mut self, entry: &SessionEntry, settled: Option<Plan>) {
        match &entry.kind {
            SessionEntryKind::Task { task_id, text } => {
                self.task_history.push(Task::new(task_id.clone(), text.clone()));
            }
            SessionEntryKind::Plan { task_id, plan } => {
                self.plans.insert(task_id.clone(), plan.clone());
            }
            SessionEntryKind::StepResult {
                task_id, attempts, ..
            } => {
                if let Some(plan) = settled {
                    self.plans.insert(task_id.clone(), plan);
                }
                self.results.extend(attempts.iter().cloned());
                self.task_results
                    .entry(task_id.clone())
                    .or_default()
                    .extend(attempts.iter().cloned());
            }
            SessionEntryKind::ChatTurn { role, content } => {
                self.chat.push(ChatMessage {
                    role: *role,
                    content: content.clone(),
                });
            }
        }
        self.last_seq = entry.seq;
    }

    /// Returns a copy of the task's plan with `step_id` moved to `status`
    /// along legal edges.
    fn settled_plan(
        &self,
        task_id: &str,
        step_id: StepId,
        status: StepStatus,
        rejected: bool,
        attempts: &[ToolInvocationResult],
    ) -> Result<Plan, ReplayViolation> {
        if self.task(task_id).is_none() {
            return Err(ReplayViolation::UnknownTask {
                task_id: task_id.to_string(),
            });
        }
        let Some(plan) = self.plans.get(task_id) else {
            return Err(ReplayViolation::MissingPlan {
                task_id: task_id.to_string(),
            });
        };
        if plan.step(step_id).is_none() {
            return Err(ReplayViolation::UnknownStep {
                task_id: task_id.to_string(),
                step_id,
            });
        }
        if !status.is_terminal() {
            return Err(ReplayViolation::NonTerminalResult { step_id, status });
        }
        if let Some(earlier) = plan
            .steps()
            .iter()
            .find(|step| step.id < step_id && !step.status.is_terminal())
        {
            return Err(ReplayViolation::OutOfOrderStep {
                step_id,
                earlier: earlier.id,
            });
        }
        if let Some(foreign) = attempts.iter().find(|attempt| attempt.step_id != step_id) {
            return Err(ReplayViolation::ForeignAttempt {
                step_id,
                found: foreign.step_id,
            });
        }

        check_attempts(step_id, status, attempts)?;

        let path: &[StepStatus] = match (status, rejected) {
            (StepStatus::Skipped, true) => &[StepStatus::Rejected, StepStatus::Skipped],
            (StepStatus::Skipped, false) => &[StepStatus::Skipped],
            (terminal, _) => &[StepStatus::Approved, terminal],
        };

        let mut plan = plan.clone();
        for next in path {
            plan.transition(step_id, *next)?;
        }
        Ok(plan)
    }
}

/// A skipped step never ran; an executed or failed one has attempts numbered
/// 1..=n whose last outcome matches the status.
fn check_attempts(
    step_id: StepId,
    status: StepStatus,
    attempts: &[ToolInvocationResult],
) -> Result<(), ReplayViolation> {
    if status == StepStatus::Skipped {
        if !attempts.is_empty() {
            return Err(ReplayViolation::SkippedWithAttempts {
                step_id,
                count: attempts.len(),
            });
        }
        return Ok(());
    }

    let Some(last) = attempts.last() else {
        return Err(ReplayViolation::MissingAttempts { step_id, status });
    };
    for (expected, attempt) in (1_u32..).zip(attempts) {
        if attempt.attempt != expected {
            return Err(ReplayViolation::AttemptOutOfSequence {
                step_id,
                expected,
                found: attempt.attempt,
            });
        }
    }
    if last.ok != (status == StepStatus::Executed) {
        return Err(ReplayViolation::OutcomeMismatch { step_id, status });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use agent_plan::{ErrorKind, Plan, ProposedStep, StepStatus, ToolInvocationResult, ToolKind};
    use serde_json::Map;

    use super::{ReplayViolation, Session};
    use crate::schema::{SessionEntry, SessionEntryKind, SessionHeader};

    fn session() -> Session {
        Session::from_header(&SessionHeader::v1("s", "2026-02-14T00:00:00Z", "/tmp"))
    }

    fn entry(seq: u64, kind: SessionEntryKind) -> SessionEntry {
        SessionEntry::new(seq, "2026-02-14T00:00:01Z", kind)
    }

    fn two_step_plan() -> Plan {
        let step = |tool| ProposedStep {
            tool,
            parameters: Map::new(),
            rationale: String::new(),
        };
        Plan::new("t1", "two", vec![step(ToolKind::ReadFile), step(ToolKind::WriteFile)])
            .expect("plan")
    }

    fn seeded() -> Session {
        let mut session = session();
        session
            .apply(&entry(
                1,
                SessionEntryKind::Task {
                    task_id: "t1".to_string(),
                    text: "do it".to_string(),
                },
            ))
            .expect("task");
        session
            .apply(&entry(
                2,
                SessionEntryKind::Plan {
                    task_id: "t1".to_string(),
                    plan: two_step_plan(),
                },
            ))
            .expect("plan");
        session
    }

    fn result(seq: u64, step_id: u32, status: StepStatus, rejected: bool) -> SessionEntry {
        let attempts = match status {
            StepStatus::Executed => vec![ToolInvocationResult::success(step_id, "ok")],
            StepStatus::Failed => vec![ToolInvocationResult::failure(step_id, ErrorKind::Io, "x")],
            _ => Vec::new(),
        };
        entry(
            seq,
            SessionEntryKind::StepResult {
                task_id: "t1".to_string(),
                step_id,
                status,
                rejected,
                attempts,
                diff: None,
                reason: None,
            },
        )
    }

    #[test]
    fn replay_settles_steps_and_collects_results() {
        let mut session = seeded();
        session
            .apply(&result(3, 0, StepStatus::Executed, false))
            .expect("step 0");
        session
            .apply(&result(4, 1, StepStatus::Skipped, true))
            .expect("step 1");

        let plan = &session.plans["t1"];
        assert_eq!(plan.steps()[0].status, StepStatus::Executed);
        assert_eq!(plan.steps()[1].status, StepStatus::Skipped);
        assert_eq!(session.results.len(), 1);
        assert_eq!(session.results_for("t1"), session.results.as_slice());
        assert!(session.results_for("t2").is_empty());
        assert_eq!(session.entry_count(), 4);
    }

    #[test]
    fn seq_gaps_are_rejected() {
        let mut session = seeded();
        let error = session
            .apply(&result(5, 0, StepStatus::Executed, false))
            .expect_err("gap");
        assert_eq!(
            error,
            ReplayViolation::NonMonotonicSeq {
                expected: 3,
                found: 5
            }
        );
    }

    #[test]
    fn steps_settle_in_id_order_only() {
        let mut session = seeded();
        let error = session
            .apply(&result(3, 1, StepStatus::Executed, false))
            .expect_err("step 1 before step 0");
        assert_eq!(
            error,
            ReplayViolation::OutOfOrderStep {
                step_id: 1,
                earlier: 0
            }
        );
    }

    #[test]
    fn failed_apply_leaves_state_untouched() {
        let mut session = seeded();
        session
            .apply(&result(3, 0, StepStatus::Executed, false))
            .expect("step 0");
        let before = session.clone();

        let error = session
            .apply(&result(4, 0, StepStatus::Failed, false))
            .expect_err("second settle of the same step");
        assert!(matches!(error, ReplayViolation::IllegalTransition(_)));
        assert_eq!(session, before);
    }

    #[test]
    fn results_for_unknown_tasks_are_rejected() {
        let mut session = session();
        let error = session
            .apply(&result(1, 0, StepStatus::Executed, false))
            .expect_err("no task");
        assert!(matches!(error, ReplayViolation::UnknownTask { .. }));
    }
}
