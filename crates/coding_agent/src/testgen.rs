//! `nv testgen file[:symbol]`: generate a test file and write it through the
//! gated executor.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use agent_plan::{Plan, ProposedStep, StepStatus, ToolKind};
use agent_provider::{ChatMessage, CompletionRequest};
use serde_json::{Map, Value};
use session_store::SessionEntryKind;

use crate::agent::{Agent, AgentError};
use crate::executor::ExecuteOptions;
use crate::planner::strip_code_fence;
use crate::summary::RunSummary;

pub const TESTGEN_TEMPERATURE: f64 = 0.1;
pub const DEFAULT_FRAMEWORK: &str = "pytest";

const TESTGEN_SYSTEM_PROMPT: &str = "You are an expert test engineer. Write thorough, \
idiomatic tests. Reply with the complete test file only, no explanations.";

/// A source file, optionally narrowed to one function or class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTarget {
    pub path: String,
    pub symbol: Option<String>,
}

impl FromStr for TestTarget {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (path, symbol) = match raw.rsplit_once(':') {
            Some((path, symbol)) if is_symbol(symbol) && !path.is_empty() => {
                (path, Some(symbol.to_string()))
            }
            _ => (raw, None),
        };
        if path.is_empty() {
            return Err("target must name a source file".to_string());
        }
        Ok(Self {
            path: path.to_string(),
            symbol,
        })
    }
}

impl fmt::Display for TestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(symbol) => write!(f, "{}:{symbol}", self.path),
            None => f.write_str(&self.path),
        }
    }
}

fn is_symbol(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .is_some_and(|first| first.is_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_alphanumeric() || ch == '_' || ch == '.')
}

impl TestTarget {
    /// `test_<stem>[_<symbol>].<ext>` next to the source file.
    #[must_use]
    pub fn default_output(&self) -> String {
        let source = Path::new(&self.path);
        let stem = source
            .file_stem()
            .map_or_else(|| "source".into(), |stem| stem.to_string_lossy());
        let suffix = self
            .symbol
            .as_deref()
            .map(|symbol| format!("_{}", symbol.replace('.', "_")))
            .unwrap_or_default();
        let extension = source
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let name = format!("test_{stem}{suffix}{extension}");
        match source.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            Some(parent) => parent.join(name).to_string_lossy().into_owned(),
            None => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestgenOptions {
    pub output: Option<String>,
    pub framework: String,
}

impl Default for TestgenOptions {
    fn default() -> Self {
        Self {
            output: None,
            framework: DEFAULT_FRAMEWORK.to_string(),
        }
    }
}

fn testgen_prompt(target: &TestTarget, source: &str, framework: &str) -> String {
    let focus = match &target.symbol {
        Some(symbol) => format!("the `{symbol}` function/class"),
        None => "all public functions and classes".to_string(),
    };
    format!(
        "Write {framework} tests for {focus} in {path}. Cover normal behavior, edge cases \
         and error handling. Import from the module under test; do not redefine it.\n\n\
         ```\n{source}\n```",
        path = target.path
    )
}

impl Agent<'_> {
    /// Generates tests for `target` and writes them as a one-step plan, so
    /// the file passes the same diff preview and approval as any other write.
    pub fn generate_tests(
        &mut self,
        target: &TestTarget,
        options: &TestgenOptions,
    ) -> Result<RunSummary, AgentError> {
        let source_path = self.workspace_root.join(&target.path);
        let source = fs::read_to_string(&source_path).map_err(|source| AgentError::Read {
            path: source_path.clone(),
            source,
        })?;
        let task = self.record_task(&format!("testgen: {target}"))?;
        let output = options
            .output
            .clone()
            .unwrap_or_else(|| target.default_output());

        writeln!(self.out, "Generating {} tests for {target}...", options.framework)?;
        let request = CompletionRequest::new(
            self.request_ids.next(),
            vec![
                ChatMessage::system(TESTGEN_SYSTEM_PROMPT),
                ChatMessage::user(testgen_prompt(target, &source, &options.framework)),
            ],
        )
        .with_model(self.planner.model.clone())
        .with_temperature(TESTGEN_TEMPERATURE);
        let reply = self.stream_reply(request, false)?;

        let mut tests = strip_code_fence(&reply).to_string();
        if tests.is_empty() {
            return Err(AgentError::EmptyReply);
        }
        tests.push('\n');

        let mut parameters = Map::new();
        parameters.insert("path".to_string(), Value::String(output.clone()));
        parameters.insert("content".to_string(), Value::String(tests));
        let mut plan = Plan::new(
            task.id.clone(),
            format!("Write tests for {target}"),
            vec![ProposedStep {
                tool: ToolKind::WriteFile,
                parameters,
                rationale: format!("Generated {} tests", options.framework),
            }],
        )?;
        self.store.append(SessionEntryKind::Plan {
            task_id: task.id.clone(),
            plan: plan.clone(),
        })?;

        let summary = self.execute(&mut plan, ExecuteOptions::default())?;
        let written = summary
            .steps
            .first()
            .is_some_and(|step| step.status == StepStatus::Executed);
        if written {
            writeln!(self.out, "Tests written to: {output}")?;
            writeln!(self.out, "Run with: {} {output}", options.framework)?;
        } else {
            write!(self.out, "{}", summary.render())?;
        }
        Ok(summary)
    }
}
