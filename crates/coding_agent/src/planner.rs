//! Turns a task into a validated [`Plan`] with one model call (plus at most
//! one corrective retry).
//!
//! The reply must be a single JSON object matching [`plan_schema`]; a single
//! surrounding Markdown code fence is the only tolerated envelope.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use agent_plan::{Plan, PlanShapeError, ProposedStep, Task, TaskId, ToolKind};
use agent_provider::{
    collect_completion, CancelSignal, ChatMessage, CompletionError, CompletionProvider,
    CompletionRequest,
};
use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use wait_timeout::ChildExt;
use walkdir::WalkDir;

use crate::providers::RequestIds;
use crate::tools::{tool_schema, tool_schemas, ToolCall};

pub const PLANNER_TEMPERATURE: f64 = 0.1;
pub const MAX_PLAN_ATTEMPTS: usize = 2;

const GIT_STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const GIT_STATUS_MAX_LINES: usize = 50;
const TREE_MAX_DEPTH: usize = 3;
const TREE_MAX_ENTRIES: usize = 200;
const TREE_SKIP_DIRS: [&str; 8] = [
    "target",
    "node_modules",
    "__pycache__",
    "build",
    "dist",
    "venv",
    ".venv",
    ".git",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanGenerationError {
    #[error("plan request failed: {0}")]
    Provider(String),
    #[error("planning was cancelled")]
    Cancelled,
    #[error("model returned an invalid plan after {attempts} attempts: {reason}")]
    Invalid { attempts: usize, reason: String },
}

/// Why one model reply was not accepted as a plan. The message is fed back
/// to the model on the retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanParseError {
    #[error("reply is not a JSON object: {0}")]
    NotJson(String),
    #[error("plan has no steps")]
    Empty,
    #[error("plan has {count} steps; at most {max} are allowed")]
    TooManySteps { count: usize, max: usize },
    #[error("invalid plan schema: {0}")]
    Schema(String),
    #[error("plan does not match the tool schema: {0}")]
    SchemaMismatch(String),
    #[error("plan shape: {0}")]
    Shape(String),
    #[error("step {position}: unknown tool '{tool}'")]
    UnknownTool { position: usize, tool: String },
    #[error("step {position}: {message}")]
    Parameters { position: usize, message: String },
    #[error(transparent)]
    Plan(#[from] PlanShapeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerOptions {
    pub max_steps: usize,
    pub model: Option<String>,
}

#[derive(Deserialize)]
struct RawPlan {
    summary: String,
    steps: Vec<RawStep>,
}

#[derive(Deserialize)]
struct RawStep {
    tool: String,
    parameters: Map<String, Value>,
    rationale: String,
}

#[must_use]
pub fn system_prompt() -> String {
    let mut tools = String::new();
    for schema in tool_schemas() {
        tools.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            schema.name, schema.description, schema.input_schema
        ));
    }

    format!(
        "You are a coding agent working inside a user's repository. Plan the \
         task as an ordered list of tool calls.\n\n\
         Available tools:\n{tools}\n\
         Reply with exactly one JSON object and nothing else:\n\
         {{\"summary\": \"<one line>\", \"steps\": [{{\"tool\": \"<tool name>\", \
         \"parameters\": {{...}}, \"rationale\": \"<why this step>\"}}]}}\n\n\
         Rules:\n\
         - Read a file before writing it.\n\
         - write_file takes the complete new file content, not a fragment.\n\
         - Use run_shell_command for tests, linters and builds only.\n\
         - Keep the plan as short as the task allows."
    )
}

#[must_use]
pub fn user_prompt(task: &Task, context: &str) -> String {
    if context.trim().is_empty() {
        return format!("Task: {}", task.text);
    }
    format!("Task: {}\n\nRepository context:\n{context}", task.text)
}

/// JSON Schema a plan reply must satisfy.
#[must_use]
pub fn plan_schema(max_steps: usize) -> Value {
    let step_variants = ToolKind::ALL
        .into_iter()
        .map(|tool| {
            json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["tool", "parameters", "rationale"],
                "properties": {
                    "tool": {"const": tool.name()},
                    "parameters": tool_schema(tool).input_schema,
                    "rationale": {"type": "string"}
                }
            })
        })
        .collect::<Vec<_>>();

    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["summary", "steps"],
        "properties": {
            "summary": {"type": "string"},
            "steps": {
                "type": "array",
                "minItems": 1,
                "maxItems": max_steps,
                "items": {"oneOf": step_variants}
            }
        }
    })
}

/// Validates a raw model reply and numbers its steps.
pub fn parse_plan(task_id: &str, raw: &str, max_steps: usize) -> Result<Plan, PlanParseError> {
    let body = strip_code_fence(raw);
    let value: Value = serde_json::from_str(body)
        .map_err(|error| PlanParseError::NotJson(error.to_string()))?;

    let step_count = value
        .get("steps")
        .and_then(Value::as_array)
        .map(Vec::len);
    match step_count {
        Some(0) => return Err(PlanParseError::Empty),
        Some(count) if count > max_steps => {
            return Err(PlanParseError::TooManySteps {
                count,
                max: max_steps,
            });
        }
        _ => {}
    }

    let schema = plan_schema(max_steps);
    let validator =
        validator_for(&schema).map_err(|error| PlanParseError::Schema(error.to_string()))?;
    if !validator.is_valid(&value) {
        let messages = validator
            .iter_errors(&value)
            .map(|error| error.to_string())
            .collect::<Vec<_>>();
        return Err(PlanParseError::SchemaMismatch(messages.join("; ")));
    }

    let raw_plan: RawPlan = serde_json::from_value(value)
        .map_err(|error| PlanParseError::Shape(error.to_string()))?;
    let mut proposed = Vec::with_capacity(raw_plan.steps.len());
    for (position, step) in raw_plan.steps.into_iter().enumerate() {
        let tool = ToolKind::parse(&step.tool).ok_or_else(|| PlanParseError::UnknownTool {
            position,
            tool: step.tool.clone(),
        })?;
        ToolCall::from_step(tool, &step.parameters).map_err(|error| {
            PlanParseError::Parameters {
                position,
                message: error.to_string(),
            }
        })?;
        proposed.push(ProposedStep {
            tool,
            parameters: step.parameters,
            rationale: step.rationale,
        });
    }

    Ok(Plan::new(TaskId::from(task_id), raw_plan.summary, proposed)?)
}

pub(crate) fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    else {
        return trimmed;
    };

    // Drop an info string such as `json` on the opening fence line.
    match inner.split_once('\n') {
        Some((info, body)) if info.trim().chars().all(|ch| ch.is_ascii_alphanumeric()) => body.trim(),
        _ => inner.trim(),
    }
}

/// Requests a plan for `task`, retrying once with the validation error fed
/// back to the model.
pub fn plan_task(
    provider: &dyn CompletionProvider,
    task: &Task,
    context: &str,
    options: &PlannerOptions,
    request_ids: &RequestIds,
    cancel: &CancelSignal,
    on_chunk: &mut dyn FnMut(&str),
) -> Result<Plan, PlanGenerationError> {
    let mut messages = vec![
        ChatMessage::system(system_prompt()),
        ChatMessage::user(user_prompt(task, context)),
    ];
    let mut reason = String::new();

    for attempt in 1..=MAX_PLAN_ATTEMPTS {
        let request = CompletionRequest::new(request_ids.next(), messages.clone())
            .with_model(options.model.clone())
            .with_temperature(PLANNER_TEMPERATURE);
        let reply = collect_completion(provider, request, cancel.clone(), on_chunk).map_err(
            |error| match error {
                CompletionError::Cancelled => PlanGenerationError::Cancelled,
                other => PlanGenerationError::Provider(other.to_string()),
            },
        )?;

        match parse_plan(&task.id, &reply, options.max_steps) {
            Ok(plan) => {
                tracing::info!(task_id = %task.id, steps = plan.len(), attempt, "plan accepted");
                return Ok(plan);
            }
            Err(error) => {
                tracing::warn!(task_id = %task.id, attempt, %error, "model returned an invalid plan");
                messages.push(ChatMessage::assistant(reply));
                messages.push(ChatMessage::user(format!(
                    "Your reply was rejected: {error}\n\
                     Reply again with only the JSON object described above."
                )));
                reason = error.to_string();
            }
        }
    }

    Err(PlanGenerationError::Invalid {
        attempts: MAX_PLAN_ATTEMPTS,
        reason,
    })
}

/// `git status --short` (when available) and a shallow file tree.
#[must_use]
pub fn repository_context(root: &Path) -> String {
    let mut context = String::new();
    if let Some(status) = git_status(root) {
        context.push_str("git status --short:\n");
        if status.trim().is_empty() {
            context.push_str("(clean)\n");
        } else {
            context.push_str(&status);
        }
        context.push('\n');
    }
    context.push_str("Files:\n");
    context.push_str(&file_tree(root));
    context
}

fn git_status(root: &Path) -> Option<String> {
    let mut child = Command::new("git")
        .args(["status", "--short"])
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    match child.wait_timeout(GIT_STATUS_TIMEOUT) {
        Ok(Some(status)) if status.success() => {}
        Ok(Some(_)) => return None,
        Ok(None) | Err(_) => {
            tracing::debug!("git status did not finish; omitting it from context");
            let _ = child.kill();
            let _ = child.wait();
            return None;
        }
    }

    let mut stdout = String::new();
    std::io::Read::read_to_string(child.stdout.as_mut()?, &mut stdout).ok()?;
    let mut lines = stdout
        .lines()
        .take(GIT_STATUS_MAX_LINES)
        .map(|line| format!("{line}\n"))
        .collect::<String>();
    if stdout.lines().count() > GIT_STATUS_MAX_LINES {
        lines.push_str("...\n");
    }
    Some(lines)
}

fn file_tree(root: &Path) -> String {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(TREE_MAX_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !name.starts_with('.')
                && !(entry.file_type().is_dir() && TREE_SKIP_DIRS.contains(&&*name))
        });

    let mut tree = String::new();
    for (count, entry) in walker.filter_map(Result::ok).enumerate() {
        if count == TREE_MAX_ENTRIES {
            tree.push_str("...\n");
            break;
        }
        let indent = "  ".repeat(entry.depth() - 1);
        let suffix = if entry.file_type().is_dir() { "/" } else { "" };
        tree.push_str(&format!(
            "{indent}{}{suffix}\n",
            entry.file_name().to_string_lossy()
        ));
    }
    tree
}

#[cfg(test)]
mod tests {
    use agent_plan::StepStatus;

    use super::*;

    const DOCSTRING_PLAN: &str = r#"{"summary": "Add docstring", "steps": [
        {"tool": "read_file", "parameters": {"path": "m.py"}, "rationale": "Inspect f"},
        {"tool": "write_file", "parameters": {"path": "m.py", "content": "x"}, "rationale": "Add it"}
    ]}"#;

    #[test]
    fn parses_a_plan_into_dense_pending_steps() {
        let plan = parse_plan("task-1", DOCSTRING_PLAN, 12).expect("valid plan");

        assert_eq!(plan.task_id(), "task-1");
        assert_eq!(plan.summary(), "Add docstring");
        let ids = plan.steps().iter().map(|step| step.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 1]);
        assert!(plan
            .steps()
            .iter()
            .all(|step| step.status == StepStatus::Pending));
    }

    #[test]
    fn tolerates_one_code_fence() {
        let fenced = format!("```json\n{DOCSTRING_PLAN}\n```");
        assert!(parse_plan("task-1", &fenced, 12).is_ok());

        let prose = format!("Here is the plan:\n{DOCSTRING_PLAN}");
        assert!(parse_plan("task-1", &prose, 12).is_err());
    }

    #[test]
    fn rejects_unknown_tools_and_extra_parameters() {
        let unknown = r#"{"summary": "s", "steps": [
            {"tool": "delete_file", "parameters": {"path": "m.py"}, "rationale": "r"}]}"#;
        assert!(matches!(
            parse_plan("task-1", unknown, 12).expect_err("unknown tool"),
            PlanParseError::SchemaMismatch(_)
        ));

        let extra = r#"{"summary": "s", "steps": [
            {"tool": "read_file", "parameters": {"path": "m.py", "lines": 3}, "rationale": "r"}]}"#;
        assert!(parse_plan("task-1", extra, 12).is_err());
    }

    #[test]
    fn rejects_empty_and_oversized_plans() {
        let empty = r#"{"summary": "s", "steps": []}"#;
        assert_eq!(
            parse_plan("task-1", empty, 12).expect_err("empty"),
            PlanParseError::Empty
        );

        let error = parse_plan("task-1", DOCSTRING_PLAN, 1).expect_err("too many steps");
        assert_eq!(error, PlanParseError::TooManySteps { count: 2, max: 1 });
        assert_eq!(error.to_string(), "plan has 2 steps; at most 1 are allowed");
    }

    #[test]
    fn blank_shell_command_fails_typed_check() {
        let blank = r#"{"summary": "s", "steps": [
            {"tool": "run_shell_command", "parameters": {"command": "   "}, "rationale": "r"}]}"#;
        let error = parse_plan("task-1", blank, 12).expect_err("blank command");
        assert!(matches!(error, PlanParseError::Parameters { position: 0, .. }));
        assert!(error.to_string().starts_with("step 0:"));
    }

    #[test]
    fn file_tree_skips_hidden_and_build_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("src")).expect("src");
        std::fs::create_dir_all(dir.path().join("target/debug")).expect("target");
        std::fs::create_dir_all(dir.path().join(".agent/sessions")).expect("agent");
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").expect("main");

        let tree = file_tree(dir.path());

        assert_eq!(tree, "src/\n  main.rs\n");
    }
}
