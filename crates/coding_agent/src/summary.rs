//! Structured run summary and the plain-text tables printed by `nv`.

use std::fmt::Write as _;

use agent_plan::{ErrorKind, Plan, PlanStep, StepId, StepStatus, TaskId, ToolKind};
use serde_json::Value;

const PARAM_PREVIEW_CHARS: usize = 50;
const OUTPUT_PREVIEW_LINES: usize = 12;

/// Outcome of one step as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub id: StepId,
    pub tool: ToolKind,
    pub rationale: String,
    pub status: StepStatus,
    pub rejected: bool,
    pub error: Option<ErrorKind>,
    pub attempts: u32,
    pub output: Option<String>,
    pub diff: Option<String>,
    pub reason: Option<String>,
}

impl StepReport {
    #[must_use]
    pub fn from_step(step: &PlanStep) -> Self {
        Self {
            id: step.id,
            tool: step.tool,
            rationale: step.rationale.clone(),
            status: step.status,
            rejected: false,
            error: None,
            attempts: 0,
            output: None,
            diff: None,
            reason: None,
        }
    }
}

/// Every terminal run ends with one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub task_id: TaskId,
    pub plan_summary: String,
    pub steps: Vec<StepReport>,
    /// Step whose rejection halted the plan.
    pub halted_at: Option<StepId>,
    pub aborted: bool,
    pub dry_run: bool,
}

impl RunSummary {
    #[must_use]
    pub fn executed(&self) -> usize {
        self.count(StepStatus::Executed)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|step| step.status == status).count()
    }

    /// Nothing failed and nothing was cut short.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed() == 0 && self.halted_at.is_none() && !self.aborted
    }

    #[must_use]
    pub fn step(&self, id: StepId) -> Option<&StepReport> {
        self.steps.iter().find(|step| step.id == id)
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(
            text,
            "Summary for {}: {} executed, {} failed, {} skipped",
            self.task_id,
            self.executed(),
            self.failed(),
            self.skipped()
        );

        for step in &self.steps {
            let mut detail = Vec::new();
            if step.rejected {
                detail.push("rejected".to_string());
            }
            if let Some(error) = step.error {
                detail.push(error.to_string());
            }
            if step.attempts > 1 {
                detail.push(format!("{} attempts", step.attempts));
            }
            if let Some(reason) = &step.reason {
                if !step.rejected {
                    detail.push(reason.clone());
                }
            }
            let detail = if detail.is_empty() {
                String::new()
            } else {
                format!(" ({})", detail.join(", "))
            };
            let _ = writeln!(
                text,
                "  [{}] {:<8} {:<17} {}{}",
                step.id, step.status, step.tool, step.rationale, detail
            );

            if step.status == StepStatus::Failed {
                if let Some(output) = &step.output {
                    text.push_str(&indent(&head_lines(output, OUTPUT_PREVIEW_LINES), "      "));
                }
            }
            if let Some(diff) = step.diff.as_deref().filter(|diff| !diff.is_empty()) {
                if step.status == StepStatus::Executed {
                    text.push_str(&indent(diff, "      "));
                }
            }
        }

        if self.dry_run {
            text.push_str("Dry run: no tools were invoked.\n");
        }
        if let Some(step_id) = self.halted_at {
            let _ = writeln!(text, "Halted: step {step_id} was rejected.");
        }
        if self.aborted {
            text.push_str("Aborted: the run was cancelled.\n");
        }
        text
    }
}

/// Plan table: id, tool, rationale and abbreviated parameters.
#[must_use]
pub fn render_plan(plan: &Plan) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Plan for {}: {}", plan.task_id(), plan.summary());
    for step in plan.steps() {
        let _ = writeln!(
            text,
            "  [{}] {:<17} {}\n      {}",
            step.id,
            step.tool,
            step.rationale,
            abbreviate_params(step)
        );
    }
    text
}

/// Plan table with the current status of every step.
#[must_use]
pub fn render_plan_status(plan: &Plan) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Plan for {}: {}", plan.task_id(), plan.summary());
    for step in plan.steps() {
        let _ = writeln!(
            text,
            "  [{}] {:<8} {:<17} {}",
            step.id, step.status, step.tool, step.rationale
        );
    }
    text
}

fn abbreviate_params(step: &PlanStep) -> String {
    step.parameters
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            format!("{key}={}", abbreviate(&rendered, PARAM_PREVIEW_CHARS))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn abbreviate(text: &str, max_chars: usize) -> String {
    let single_line = text.replace('\n', "\\n");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    let mut cut = single_line.chars().take(max_chars).collect::<String>();
    cut.push_str("...");
    cut
}

fn head_lines(text: &str, max_lines: usize) -> String {
    let mut lines = text.lines().take(max_lines).collect::<Vec<_>>().join("\n");
    if text.lines().count() > max_lines {
        lines.push_str("\n...");
    }
    lines
}

fn indent(text: &str, prefix: &str) -> String {
    let mut out = String::new();
    for line in text.lines() {
        out.push_str(prefix);
        out.push_str(line);
        out.push('\n');
    }
    out
}
