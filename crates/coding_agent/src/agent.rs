//! Task-level flows: plan and execute a coding task, or run one command with
//! an optional plan-and-fix loop.

use std::io::{self, Write};
use std::path::PathBuf;

use agent_plan::{Plan, PlanShapeError, ProposedStep, StepStatus, Task, ToolKind};
use agent_provider::{
    collect_completion, is_cancelled, CancelSignal, CompletionError, CompletionProvider,
    CompletionRequest,
};
use serde_json::{json, Map, Value};
use session_store::{SessionEntryKind, SessionStore, SessionStoreError};
use thiserror::Error;

use crate::executor::{execute_plan, ExecuteOptions, ExecutorContext, ExecutorError, ExecutorEvent};
use crate::planner::{plan_task, repository_context, PlanGenerationError, PlannerOptions};
use crate::providers::RequestIds;
use crate::safety::{ApprovalSource, ConfirmationRequest, Confirmer, SafetyGate};
use crate::summary::{render_plan, RunSummary};
use crate::tools::{shell_exit_code, ToolRunner};

pub const MAX_FIX_ITERATIONS: usize = 3;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Plan(#[from] PlanGenerationError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("session store: {0}")]
    Session(#[from] SessionStoreError),
    #[error(transparent)]
    PlanShape(#[from] PlanShapeError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("the model returned an empty reply")]
    EmptyReply,
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeTaskOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    pub fix: bool,
    pub timeout_sec: Option<u64>,
}

/// Result of `nv run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit code of the last run; `None` if it never ran to completion.
    pub exit_code: Option<i32>,
    pub fix_iterations: usize,
    pub last_run: RunSummary,
}

impl CommandOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// One `nv` run. The gate lives here so approve-all lasts exactly as long as
/// the run.
pub struct Agent<'a> {
    pub provider: &'a dyn CompletionProvider,
    pub tools: &'a mut dyn ToolRunner,
    pub gate: SafetyGate,
    pub confirmer: &'a mut dyn Confirmer,
    pub store: &'a mut SessionStore,
    pub request_ids: &'a RequestIds,
    pub cancel: CancelSignal,
    pub out: &'a mut dyn Write,
    pub workspace_root: PathBuf,
    pub planner: PlannerOptions,
}

impl Agent<'_> {
    /// Plans `task_text`, asks once whether to execute, then executes.
    pub fn run_code_task(
        &mut self,
        task_text: &str,
        options: CodeTaskOptions,
    ) -> Result<RunSummary, AgentError> {
        let task = self.record_task(task_text)?;

        writeln!(self.out, "Planning {}...", task.id)?;
        let context = repository_context(&self.workspace_root);
        let mut plan = plan_task(
            self.provider,
            &task,
            &context,
            &self.planner,
            self.request_ids,
            &self.cancel,
            &mut |chunk| tracing::trace!(chunk, "plan chunk"),
        )?;
        self.store.append(SessionEntryKind::Plan {
            task_id: task.id.clone(),
            plan: plan.clone(),
        })?;
        write!(self.out, "{}", render_plan(&plan))?;

        let declined = if options.dry_run || self.gate.approves_all() {
            false
        } else {
            let request = ConfirmationRequest::Plan {
                summary: plan.summary().to_string(),
                step_count: plan.len(),
            };
            !self.gate.ask(&request, self.confirmer, &self.cancel).is_approved()
        };
        if declined {
            writeln!(self.out, "Plan declined; nothing was changed.")?;
        }

        let summary = self.execute(
            &mut plan,
            ExecuteOptions {
                dry_run: options.dry_run,
                declined,
            },
        )?;
        write!(self.out, "{}", summary.render())?;
        Ok(summary)
    }

    /// Runs `command` through the gate. With `fix`, a failing command is
    /// handed to the planner as a fix task and re-run, up to
    /// [`MAX_FIX_ITERATIONS`] times.
    pub fn run_command(
        &mut self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandOutcome, AgentError> {
        let (mut exit_code, mut last_run) = self.run_command_once(command, options.timeout_sec)?;
        let mut fix_iterations = 0;

        while options.fix
            && exit_code != Some(0)
            && fix_iterations < MAX_FIX_ITERATIONS
            && !is_cancelled(&self.cancel)
        {
            // A skipped or rejected run has nothing to fix.
            let Some(output) = last_run
                .steps
                .first()
                .filter(|step| step.status == StepStatus::Failed)
                .and_then(|step| step.output.clone())
            else {
                break;
            };

            fix_iterations += 1;
            writeln!(
                self.out,
                "Fix attempt {fix_iterations}/{MAX_FIX_ITERATIONS} for `{command}`"
            )?;
            let fix = self.run_code_task(&fix_task_text(command, &output), CodeTaskOptions::default())?;
            if fix.halted_at.is_some() || fix.aborted {
                break;
            }

            (exit_code, last_run) = self.run_command_once(command, options.timeout_sec)?;
        }

        Ok(CommandOutcome {
            exit_code,
            fix_iterations,
            last_run,
        })
    }

    fn run_command_once(
        &mut self,
        command: &str,
        timeout_sec: Option<u64>,
    ) -> Result<(Option<i32>, RunSummary), AgentError> {
        let task = self.record_task(&format!("run: {command}"))?;

        let mut parameters = Map::new();
        parameters.insert("command".to_string(), Value::String(command.to_string()));
        if let Some(timeout_sec) = timeout_sec {
            parameters.insert("timeout_sec".to_string(), json!(timeout_sec));
        }
        let mut plan = Plan::new(
            task.id.clone(),
            format!("Run `{command}`"),
            vec![ProposedStep {
                tool: ToolKind::RunShellCommand,
                parameters,
                rationale: "Run the requested command".to_string(),
            }],
        )?;
        self.store.append(SessionEntryKind::Plan {
            task_id: task.id.clone(),
            plan: plan.clone(),
        })?;

        let summary = self.execute(&mut plan, ExecuteOptions::default())?;
        let report = summary.steps.first();
        if let Some(output) = report.and_then(|step| step.output.as_deref()) {
            writeln!(self.out, "{output}")?;
        }
        if let Some(reason) = report.and_then(|step| step.reason.as_deref()) {
            writeln!(self.out, "Command not run: {reason}")?;
        }

        let exit_code = report
            .and_then(|step| step.output.as_deref())
            .and_then(shell_exit_code);
        Ok((exit_code, summary))
    }

    pub(crate) fn record_task(&mut self, text: &str) -> Result<Task, AgentError> {
        let task = Task::new(
            format!("task-{}", self.store.session().task_history.len() + 1),
            text,
        );
        self.store.append(SessionEntryKind::Task {
            task_id: task.id.clone(),
            text: task.text.clone(),
        })?;
        Ok(task)
    }

    /// Runs `request` to completion. With `echo`, chunks are written to the
    /// output as they arrive.
    pub(crate) fn stream_reply(
        &mut self,
        request: CompletionRequest,
        echo: bool,
    ) -> Result<String, AgentError> {
        let out = &mut *self.out;
        let mut stream_error: Option<io::Error> = None;
        let reply = collect_completion(self.provider, request, self.cancel.clone(), &mut |chunk| {
            if echo && stream_error.is_none() {
                stream_error = write!(out, "{chunk}").and_then(|()| out.flush()).err();
            }
        });
        if let Some(error) = stream_error {
            return Err(error.into());
        }
        Ok(reply?)
    }

    pub(crate) fn execute(
        &mut self,
        plan: &mut Plan,
        options: ExecuteOptions,
    ) -> Result<RunSummary, AgentError> {
        let out = &mut *self.out;
        let mut pending_diff: Option<String> = None;
        // The plan keeps running when the terminal goes away; the first
        // write error is reported once it has settled.
        let mut output_error: Option<io::Error> = None;
        let mut observer = |event: &ExecutorEvent| {
            if output_error.is_some() {
                return;
            }
            if let Err(error) = report_event(out, event, &mut pending_diff) {
                tracing::warn!(%error, "failed to report executor progress");
                output_error = Some(error);
            }
        };
        let mut ctx = ExecutorContext {
            tools: &mut *self.tools,
            gate: &mut self.gate,
            confirmer: &mut *self.confirmer,
            sink: &mut *self.store,
            cancel: &self.cancel,
            observer: &mut observer,
        };
        let summary = execute_plan(plan, &mut ctx, options)?;
        match output_error {
            Some(error) => Err(AgentError::Output(error)),
            None => Ok(summary),
        }
    }
}

fn report_event(
    out: &mut dyn Write,
    event: &ExecutorEvent,
    pending_diff: &mut Option<String>,
) -> io::Result<()> {
    match event {
        ExecutorEvent::StepStarted { step } => {
            writeln!(out, "-> [{}] {}: {}", step.id, step.tool, step.rationale)
        }
        ExecutorEvent::DiffPreview { diff, .. } => {
            *pending_diff = Some(diff.clone());
            Ok(())
        }
        ExecutorEvent::PreviewFailed { message, .. } => {
            writeln!(out, "   diff preview unavailable: {message}")
        }
        ExecutorEvent::Approved { source, .. } => {
            let diff = pending_diff.take();
            // Approve-all skips the prompt, so the diff has not been shown yet.
            match (source, diff) {
                (ApprovalSource::ApproveAll, Some(diff)) => write!(out, "{diff}"),
                _ => Ok(()),
            }
        }
        ExecutorEvent::Retrying { step_id, attempt } => {
            writeln!(out, "   step {step_id} timed out; retrying (attempt {attempt})")
        }
        ExecutorEvent::StepFinished { report } => {
            *pending_diff = None;
            let detail = match (report.error, report.reason.as_deref()) {
                (Some(error), _) => format!(" ({error})"),
                (None, Some(reason)) => format!(" ({reason})"),
                (None, None) => String::new(),
            };
            writeln!(out, "   [{}] {}{}", report.id, report.status, detail)
        }
    }
}

fn fix_task_text(command: &str, output: &str) -> String {
    format!(
        "The command `{command}` fails. Change the code so that it succeeds; \
         do not change the command itself.\n\nCaptured output:\n{output}"
    )
}

#[cfg(test)]
mod tests {
    use super::fix_task_text;

    #[test]
    fn fix_task_carries_command_and_output() {
        let text = fix_task_text("pytest", "status: exit_code=1\nstdout:\nFAILED\n");
        assert!(text.contains("`pytest`"));
        assert!(text.ends_with("Captured output:\nstatus: exit_code=1\nstdout:\nFAILED\n"));
    }
}
