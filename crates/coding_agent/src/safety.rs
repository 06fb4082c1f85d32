//! Safety gate: decides whether a step may run. It never runs anything itself.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use agent_plan::PlanStep;
use agent_provider::{is_cancelled, CancelSignal};

use crate::tools::ToolCall;

/// Shell metacharacters that disable prefix matching against the allow-list.
const SHELL_METACHARACTERS: [&str; 8] = [";", "&", "|", "`", "$(", ">", "<", "\n"];

/// How a step would be treated before anyone is asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    AutoApproved,
    AllowlistApproved,
    AwaitingConfirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalSource {
    ReadOnly,
    Allowlist,
    Confirmed,
    ApproveAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Approved(ApprovalSource),
    Rejected,
}

impl GateDecision {
    #[must_use]
    pub fn is_approved(self) -> bool {
        matches!(self, Self::Approved(_))
    }
}

/// Configured command strings exempt from confirmation.
///
/// Entries and commands are compared on whitespace-separated tokens. A
/// command matches when its tokens equal an entry's, or start with them and
/// the command contains no shell metacharacters (so `pytest` admits
/// `pytest tests/` but not `pytest; rm -rf .`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allowlist {
    entries: Vec<Vec<String>>,
}

impl Allowlist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|entry| tokens(entry.as_ref()))
            .filter(|tokens| !tokens.is_empty())
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn matches(&self, command: &str) -> bool {
        let command_tokens = tokens(command);
        if command_tokens.is_empty() {
            return false;
        }
        let plain = !SHELL_METACHARACTERS
            .iter()
            .any(|meta| command.contains(meta));

        self.entries.iter().any(|entry| {
            *entry == command_tokens || (plain && command_tokens.starts_with(entry))
        })
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

/// What the user is asked to approve.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationRequest {
    Step {
        step: PlanStep,
        diff: Option<String>,
        preview_error: Option<String>,
    },
    Plan {
        summary: String,
        step_count: usize,
    },
    Patch {
        diff: String,
    },
}

impl ConfirmationRequest {
    /// Text shown above the prompt.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Step {
                step,
                diff,
                preview_error,
            } => {
                let mut text = format!("Step {} [{}]: {}\n", step.id, step.tool, step.rationale);
                if let Some(command) = step.str_param("command") {
                    text.push_str(&format!("  $ {command}\n"));
                }
                match (diff, preview_error) {
                    (Some(diff), _) if !diff.is_empty() => text.push_str(diff),
                    (Some(_), _) => text.push_str("  (no changes)\n"),
                    (None, Some(error)) => {
                        text.push_str(&format!("  diff preview unavailable: {error}\n"));
                    }
                    (None, None) => {}
                }
                text
            }
            Self::Plan {
                summary,
                step_count,
            } => format!("Plan: {summary} ({step_count} steps)\n"),
            Self::Patch { diff } => diff.clone(),
        }
    }

    fn question(&self) -> &'static str {
        match self {
            Self::Step { .. } => "Approve this step?",
            Self::Plan { .. } => "Execute this plan?",
            Self::Patch { .. } => "Apply this patch?",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResponse {
    Approve,
    Reject,
    /// Approve this and every later request in the same run.
    ApproveAll,
}

/// Synchronous confirmation channel.
pub trait Confirmer {
    fn confirm(&mut self, request: &ConfirmationRequest) -> ConfirmationResponse;
}

/// Per-run gate state. Only the approve-all escalation is remembered.
#[derive(Debug, Clone)]
pub struct SafetyGate {
    allowlist: Allowlist,
    approve_all: bool,
}

impl SafetyGate {
    #[must_use]
    pub fn new(allowlist: Allowlist, approve_all: bool) -> Self {
        Self {
            allowlist,
            approve_all,
        }
    }

    #[must_use]
    pub fn approves_all(&self) -> bool {
        self.approve_all
    }

    /// Pure policy: read-only first, then the allow-list, otherwise ask.
    #[must_use]
    pub fn classify(&self, call: &ToolCall) -> Classification {
        if call.kind().is_read_only() {
            return Classification::AutoApproved;
        }
        match call {
            ToolCall::RunShellCommand { command, .. } if self.allowlist.matches(command) => {
                Classification::AllowlistApproved
            }
            _ => Classification::AwaitingConfirmation,
        }
    }

    /// Classifies `call` and asks `confirmer` only when needed. A cancelled
    /// run never approves.
    pub fn decide(
        &mut self,
        call: &ToolCall,
        request: &ConfirmationRequest,
        confirmer: &mut dyn Confirmer,
        cancel: &CancelSignal,
    ) -> GateDecision {
        match self.classify(call) {
            Classification::AutoApproved => GateDecision::Approved(ApprovalSource::ReadOnly),
            Classification::AllowlistApproved => GateDecision::Approved(ApprovalSource::Allowlist),
            Classification::AwaitingConfirmation => self.ask(request, confirmer, cancel),
        }
    }

    /// Asks for anything outside the per-step policy (plan, command, patch).
    pub fn ask(
        &mut self,
        request: &ConfirmationRequest,
        confirmer: &mut dyn Confirmer,
        cancel: &CancelSignal,
    ) -> GateDecision {
        if is_cancelled(cancel) {
            return GateDecision::Rejected;
        }
        if self.approve_all {
            return GateDecision::Approved(ApprovalSource::ApproveAll);
        }

        match confirmer.confirm(request) {
            _ if is_cancelled(cancel) => GateDecision::Rejected,
            ConfirmationResponse::Approve => GateDecision::Approved(ApprovalSource::Confirmed),
            ConfirmationResponse::ApproveAll => {
                tracing::info!("approve-all enabled for the rest of this run");
                self.approve_all = true;
                GateDecision::Approved(ApprovalSource::Confirmed)
            }
            ConfirmationResponse::Reject => GateDecision::Rejected,
        }
    }
}

/// Line-based yes/no prompt. End of input, unrecognised answers and
/// cancellation all reject.
pub struct TerminalConfirmer<R, W> {
    input: R,
    output: W,
    cancel: CancelSignal,
}

impl<R: BufRead, W: Write> TerminalConfirmer<R, W> {
    pub fn new(input: R, output: W, cancel: CancelSignal) -> Self {
        Self {
            input,
            output,
            cancel,
        }
    }

    fn prompt(&mut self, request: &ConfirmationRequest) -> io::Result<ConfirmationResponse> {
        write!(
            self.output,
            "{}{} [y]es / [N]o / [a]ll: ",
            request.render(),
            request.question()
        )?;
        self.output.flush()?;

        let mut answer = String::new();
        if self.input.read_line(&mut answer)? == 0 || is_cancelled(&self.cancel) {
            writeln!(self.output)?;
            return Ok(ConfirmationResponse::Reject);
        }

        Ok(match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => ConfirmationResponse::Approve,
            "a" | "all" => ConfirmationResponse::ApproveAll,
            _ => ConfirmationResponse::Reject,
        })
    }
}

impl TerminalConfirmer<io::StdinLock<'static>, io::Stdout> {
    #[must_use]
    pub fn stdio(cancel: CancelSignal) -> Self {
        Self::new(io::stdin().lock(), io::stdout(), cancel)
    }
}

impl<R: BufRead, W: Write> Confirmer for TerminalConfirmer<R, W> {
    fn confirm(&mut self, request: &ConfirmationRequest) -> ConfirmationResponse {
        self.prompt(request).unwrap_or_else(|error| {
            tracing::warn!(%error, "confirmation prompt failed; rejecting");
            ConfirmationResponse::Reject
        })
    }
}

/// Replays fixed answers and records what was asked. Rejects once the
/// script runs out.
#[derive(Debug, Default)]
pub struct ScriptedConfirmer {
    responses: VecDeque<ConfirmationResponse>,
    requests: Vec<ConfirmationRequest>,
}

impl ScriptedConfirmer {
    pub fn new(responses: impl IntoIterator<Item = ConfirmationResponse>) -> Self {
        Self {
            responses: responses.into_iter().collect(),
            requests: Vec::new(),
        }
    }

    #[must_use]
    pub fn requests(&self) -> &[ConfirmationRequest] {
        &self.requests
    }
}

impl Confirmer for ScriptedConfirmer {
    fn confirm(&mut self, request: &ConfirmationRequest) -> ConfirmationResponse {
        self.requests.push(request.clone());
        self.responses
            .pop_front()
            .unwrap_or(ConfirmationResponse::Reject)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use agent_provider::cancel_signal;

    use super::*;
    use crate::tools::WriteMode;

    fn shell(command: &str) -> ToolCall {
        ToolCall::RunShellCommand {
            command: command.to_string(),
            timeout_sec: None,
        }
    }

    fn command_request(command: &str) -> ConfirmationRequest {
        let mut parameters = serde_json::Map::new();
        parameters.insert("command".to_string(), command.into());
        ConfirmationRequest::Step {
            step: PlanStep {
                id: 1,
                tool: agent_plan::ToolKind::RunShellCommand,
                parameters,
                rationale: "run it".to_string(),
                status: agent_plan::StepStatus::Pending,
            },
            diff: None,
            preview_error: None,
        }
    }

    #[test]
    fn read_only_tools_are_auto_approved() {
        let gate = SafetyGate::new(Allowlist::default(), false);
        let read = ToolCall::ReadFile {
            path: "m.py".to_string(),
        };
        let search = ToolCall::SearchText {
            query: "def".to_string(),
            scope: ".".to_string(),
        };

        assert_eq!(gate.classify(&read), Classification::AutoApproved);
        assert_eq!(gate.classify(&search), Classification::AutoApproved);
    }

    #[test]
    fn writes_always_need_confirmation() {
        let gate = SafetyGate::new(Allowlist::new(["cat"]), false);
        let write = ToolCall::WriteFile {
            path: "m.py".to_string(),
            content: String::new(),
            mode: WriteMode::Overwrite,
        };
        assert_eq!(gate.classify(&write), Classification::AwaitingConfirmation);
    }

    #[test]
    fn allowlist_matches_normalized_tokens_and_prefixes() {
        let allowlist = Allowlist::new(["pytest", "cargo  test"]);

        assert!(allowlist.matches("pytest"));
        assert!(allowlist.matches("  pytest   tests/ "));
        assert!(allowlist.matches("cargo test -p agent_plan"));
        assert!(!allowlist.matches("cargo build"));
        assert!(!allowlist.matches("pytestx"));
        assert!(!allowlist.matches("pytest; rm -rf ."));
        assert!(!allowlist.matches("pytest $(whoami)"));
        assert!(!allowlist.matches("pytest > out.txt"));
    }

    #[test]
    fn allowlisted_shell_skips_confirmer() {
        let mut gate = SafetyGate::new(Allowlist::new(["pytest"]), false);
        let mut confirmer = ScriptedConfirmer::default();

        let decision = gate.decide(
            &shell("pytest tests/"),
            &command_request("pytest tests/"),
            &mut confirmer,
            &cancel_signal(),
        );

        assert_eq!(decision, GateDecision::Approved(ApprovalSource::Allowlist));
        assert!(confirmer.requests().is_empty());
    }

    #[test]
    fn approve_all_applies_to_later_requests_in_the_same_gate() {
        let mut gate = SafetyGate::new(Allowlist::default(), false);
        let mut confirmer = ScriptedConfirmer::new([ConfirmationResponse::ApproveAll]);
        let cancel = cancel_signal();

        let first = gate.decide(&shell("make"), &command_request("make"), &mut confirmer, &cancel);
        let second = gate.decide(&shell("make install"), &command_request("make install"), &mut confirmer, &cancel);

        assert_eq!(first, GateDecision::Approved(ApprovalSource::Confirmed));
        assert_eq!(second, GateDecision::Approved(ApprovalSource::ApproveAll));
        assert_eq!(confirmer.requests().len(), 1);

        let fresh = SafetyGate::new(Allowlist::default(), false);
        assert!(!fresh.approves_all());
    }

    #[test]
    fn cancelled_run_rejects_without_asking() {
        let mut gate = SafetyGate::new(Allowlist::default(), true);
        let mut confirmer = ScriptedConfirmer::new([ConfirmationResponse::Approve]);
        let cancel = cancel_signal();
        cancel.store(true, std::sync::atomic::Ordering::SeqCst);

        let decision = gate.decide(&shell("make"), &command_request("make"), &mut confirmer, &cancel);

        assert_eq!(decision, GateDecision::Rejected);
        assert!(confirmer.requests().is_empty());
    }

    #[test]
    fn terminal_confirmer_parses_answers() {
        let cases = [
            ("y\n", ConfirmationResponse::Approve),
            ("YES\n", ConfirmationResponse::Approve),
            ("a\n", ConfirmationResponse::ApproveAll),
            ("n\n", ConfirmationResponse::Reject),
            ("\n", ConfirmationResponse::Reject),
            ("", ConfirmationResponse::Reject),
        ];

        for (input, expected) in cases {
            let mut output = Vec::new();
            let mut confirmer =
                TerminalConfirmer::new(Cursor::new(input.as_bytes()), &mut output, cancel_signal());
            assert_eq!(confirmer.confirm(&command_request("ls")), expected, "input {input:?}");
            let shown = String::from_utf8(output).expect("utf8 prompt");
            assert!(
                shown.starts_with(
                    "Step 1 [run_shell_command]: run it\n  $ ls\nApprove this step? [y]es / [N]o / [a]ll: "
                ),
                "{shown}"
            );
        }
    }
}
