//! Sequential plan executor.
//!
//! Steps run strictly in id order. For each step: decode parameters, preview
//! writes, ask the gate, invoke the tool (retrying one transient failure),
//! then append the terminal outcome to the transcript before moving on. A
//! transcript write failure aborts the run; tool failures never do.

use agent_plan::{Plan, PlanStep, StepId, StepStatus, ToolInvocationResult, TransitionError};
use agent_provider::{is_cancelled, CancelSignal};
use session_store::{SessionEntryKind, SessionStore, SessionStoreError};
use thiserror::Error;

use crate::safety::{ApprovalSource, ConfirmationRequest, Confirmer, GateDecision, SafetyGate};
use crate::summary::{RunSummary, StepReport};
use crate::tools::{ToolCall, ToolRunner};

/// Where executor outcomes are persisted.
pub trait TranscriptSink {
    fn record(&mut self, entry: SessionEntryKind) -> Result<(), SessionStoreError>;
}

impl TranscriptSink for SessionStore {
    fn record(&mut self, entry: SessionEntryKind) -> Result<(), SessionStoreError> {
        self.append(entry).map(|_| ())
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to record step outcome: {0}")]
    Transcript(#[from] SessionStoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Progress notifications for the terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    StepStarted { step: PlanStep },
    DiffPreview { step_id: StepId, diff: String },
    PreviewFailed { step_id: StepId, message: String },
    Approved { step_id: StepId, source: ApprovalSource },
    Retrying { step_id: StepId, attempt: u32 },
    StepFinished { report: StepReport },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Settle every step as `Skipped` without touching the gate or tools.
    pub dry_run: bool,
    /// The user declined the whole plan up front.
    pub declined: bool,
}

/// Collaborators for one run, all passed explicitly.
pub struct ExecutorContext<'a> {
    pub tools: &'a mut dyn ToolRunner,
    pub gate: &'a mut SafetyGate,
    pub confirmer: &'a mut dyn Confirmer,
    pub sink: &'a mut dyn TranscriptSink,
    pub cancel: &'a CancelSignal,
    pub observer: &'a mut dyn FnMut(&ExecutorEvent),
}

/// Why a step was settled without running.
enum Halt {
    DryRun,
    Declined,
    Rejected(StepId),
    Cancelled,
}

impl Halt {
    fn reason(&self) -> String {
        match self {
            Self::DryRun => "dry run".to_string(),
            Self::Declined => "plan declined".to_string(),
            Self::Rejected(step_id) => format!("plan halted after step {step_id} was rejected"),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Drives `plan` to completion and returns the summary.
///
/// On `Err` the plan and transcript hold every outcome settled so far.
pub fn execute_plan(
    plan: &mut Plan,
    ctx: &mut ExecutorContext<'_>,
    options: ExecuteOptions,
) -> Result<RunSummary, ExecutorError> {
    let task_id = plan.task_id().to_string();
    let mut halt = if options.dry_run {
        Some(Halt::DryRun)
    } else if options.declined {
        Some(Halt::Declined)
    } else {
        None
    };
    let mut reports = Vec::with_capacity(plan.len());

    tracing::info!(task_id = %task_id, steps = plan.len(), dry_run = options.dry_run, "executing plan");

    let ids = plan.steps().iter().map(|step| step.id).collect::<Vec<_>>();
    for step_id in ids {
        let Some(step) = plan.step(step_id).cloned() else {
            continue;
        };
        if step.status.is_terminal() {
            reports.push(StepReport::from_step(&step));
            continue;
        }

        if halt.is_none() && is_cancelled(ctx.cancel) {
            tracing::info!(step_id, "run cancelled; skipping remaining steps");
            halt = Some(Halt::Cancelled);
        }
        if let Some(reason) = &halt {
            let report = skip_step(plan, ctx, &step, reason.reason())?;
            reports.push(report);
            continue;
        }

        let report = run_step(plan, ctx, &step)?;
        if report.rejected {
            halt = Some(Halt::Rejected(step_id));
        }
        reports.push(report);
    }

    if halt.is_none() && is_cancelled(ctx.cancel) {
        halt = Some(Halt::Cancelled);
    }

    Ok(RunSummary {
        task_id,
        plan_summary: plan.summary().to_string(),
        steps: reports,
        halted_at: match halt {
            Some(Halt::Rejected(step_id)) => Some(step_id),
            _ => None,
        },
        aborted: matches!(halt, Some(Halt::Cancelled)),
        dry_run: options.dry_run,
    })
}

fn run_step(
    plan: &mut Plan,
    ctx: &mut ExecutorContext<'_>,
    step: &PlanStep,
) -> Result<StepReport, ExecutorError> {
    let step_id = step.id;
    (ctx.observer)(&ExecutorEvent::StepStarted { step: step.clone() });

    let call = match ToolCall::from_step(step.tool, &step.parameters) {
        Ok(call) => call,
        Err(error) => return skip_step(plan, ctx, step, error.to_string()),
    };

    let (diff, preview_error) = match &call {
        ToolCall::WriteFile {
            path,
            content,
            mode,
        } => match ctx.tools.preview_write(path, content, *mode) {
            Ok(diff) => {
                (ctx.observer)(&ExecutorEvent::DiffPreview {
                    step_id,
                    diff: diff.clone(),
                });
                (Some(diff), None)
            }
            Err(failure) => {
                let message = failure.to_string();
                (ctx.observer)(&ExecutorEvent::PreviewFailed {
                    step_id,
                    message: message.clone(),
                });
                (None, Some(message))
            }
        },
        _ => (None, None),
    };

    let request = ConfirmationRequest::Step {
        step: step.clone(),
        diff: diff.clone(),
        preview_error,
    };
    let source = match ctx.gate.decide(&call, &request, ctx.confirmer, ctx.cancel) {
        GateDecision::Approved(source) => source,
        GateDecision::Rejected if is_cancelled(ctx.cancel) => {
            return skip_step(plan, ctx, step, Halt::Cancelled.reason());
        }
        GateDecision::Rejected => return reject_step(plan, ctx, step, diff),
    };

    plan.transition(step_id, StepStatus::Approved)?;
    (ctx.observer)(&ExecutorEvent::Approved { step_id, source });

    let mut attempts = vec![ctx.tools.invoke(step_id, &call, ctx.cancel)];
    if attempts[0].is_transient_failure() && !is_cancelled(ctx.cancel) {
        tracing::warn!(step_id, tool = %step.tool, "transient failure; retrying once");
        (ctx.observer)(&ExecutorEvent::Retrying { step_id, attempt: 2 });
        attempts.push(ctx.tools.invoke(step_id, &call, ctx.cancel).with_attempt(2));
    }

    let last = attempts
        .last()
        .cloned()
        .unwrap_or_else(|| ToolInvocationResult::success(step_id, String::new()));
    let status = if last.ok {
        StepStatus::Executed
    } else {
        StepStatus::Failed
    };
    plan.transition(step_id, status)?;

    let diff = diff.filter(|diff| !diff.is_empty() && status == StepStatus::Executed);
    ctx.sink.record(SessionEntryKind::StepResult {
        task_id: plan.task_id().to_string(),
        step_id,
        status,
        rejected: false,
        attempts: attempts.clone(),
        diff: diff.clone(),
        reason: None,
    })?;

    let report = StepReport {
        status,
        error: last.error,
        attempts: u32::try_from(attempts.len()).unwrap_or(u32::MAX),
        output: Some(last.output),
        diff,
        ..StepReport::from_step(step)
    };
    tracing::debug!(step_id, status = %status, attempts = report.attempts, "step finished");
    (ctx.observer)(&ExecutorEvent::StepFinished {
        report: report.clone(),
    });
    Ok(report)
}

fn reject_step(
    plan: &mut Plan,
    ctx: &mut ExecutorContext<'_>,
    step: &PlanStep,
    diff: Option<String>,
) -> Result<StepReport, ExecutorError> {
    plan.transition(step.id, StepStatus::Rejected)?;
    plan.transition(step.id, StepStatus::Skipped)?;
    tracing::info!(step_id = step.id, "step rejected; halting plan");

    let reason = "rejected by user".to_string();
    ctx.sink.record(SessionEntryKind::StepResult {
        task_id: plan.task_id().to_string(),
        step_id: step.id,
        status: StepStatus::Skipped,
        rejected: true,
        attempts: Vec::new(),
        diff: diff.clone(),
        reason: Some(reason.clone()),
    })?;

    let report = StepReport {
        status: StepStatus::Skipped,
        rejected: true,
        diff,
        reason: Some(reason),
        ..StepReport::from_step(step)
    };
    (ctx.observer)(&ExecutorEvent::StepFinished {
        report: report.clone(),
    });
    Ok(report)
}

fn skip_step(
    plan: &mut Plan,
    ctx: &mut ExecutorContext<'_>,
    step: &PlanStep,
    reason: String,
) -> Result<StepReport, ExecutorError> {
    plan.transition(step.id, StepStatus::Skipped)?;
    ctx.sink.record(SessionEntryKind::StepResult {
        task_id: plan.task_id().to_string(),
        step_id: step.id,
        status: StepStatus::Skipped,
        rejected: false,
        attempts: Vec::new(),
        diff: None,
        reason: Some(reason.clone()),
    })?;

    let report = StepReport {
        status: StepStatus::Skipped,
        reason: Some(reason),
        ..StepReport::from_step(step)
    };
    (ctx.observer)(&ExecutorEvent::StepFinished {
        report: report.clone(),
    });
    Ok(report)
}
