//! `nv logs analyze`: root-cause analysis of the tail of a log.


use agent_provider::{ChatMessage, ChatRole, CompletionRequest};
use session_store::SessionEntryKind;

use crate::agent::{Agent, AgentError};

pub const DEFAULT_TAIL_LINES: usize = 200;
pub const LOG_ANALYSIS_TEMPERATURE: f64 = 0.2;

const SRE_SYSTEM_PROMPT: &str = "You are an expert SRE and software engineer. You read logs, \
find the root cause of failures and suggest concrete fixes. Be specific; quote the log lines \
you rely on.";

/// The last lines of a log, plus how much was cut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogExcerpt {
    pub text: String,
    pub shown: usize,
    pub total: usize,
}

impl LogExcerpt {
    /// Keeps the last `tail` lines of `log`.
    #[must_use]
    pub fn tail(log: &str, tail: usize) -> Self {
        let lines = log.lines().collect::<Vec<_>>();
        let total = lines.len();
        let kept = &lines[total.saturating_sub(tail)..];
        Self {
            text: kept.join("\n"),
            shown: kept.len(),
            total,
        }
    }

    #[must_use]
    pub fn describe(&self, source: &str) -> String {
        if self.shown < self.total {
            format!("Analyzing last {} of {} lines from {source}", self.shown, self.total)
        } else {
            format!("Analyzing {} lines from {source}", self.total)
        }
    }
}

fn analysis_prompt(source: &str, excerpt: &LogExcerpt) -> String {
    format!(
        "Analyze these log lines from {source} and write a root-cause analysis with these \
         sections:\n\n\
         1. Error Summary: what failed, in one or two sentences.\n\
         2. Root Cause: the most likely underlying cause.\n\
         3. Affected Components: services, modules or files involved.\n\
         4. Recommended Fix: concrete steps or code changes.\n\
         5. Prevention: how to keep it from happening again.\n\n\
         ```\n{}\n```",
        excerpt.text
    )
}

impl Agent<'_> {
    /// Streams an analysis of the last `tail` lines of `log` and records the
    /// request and report as a chat exchange.
    pub fn analyze_logs(
        &mut self,
        source: &str,
        log: &str,
        tail: usize,
    ) -> Result<String, AgentError> {
        let excerpt = LogExcerpt::tail(log, tail);
        if excerpt.total == 0 {
            writeln!(self.out, "{source} is empty; nothing to analyze.")?;
            return Ok(String::new());
        }

        self.record_task(&format!("logs: analyze {source}"))?;
        let description = excerpt.describe(source);
        writeln!(self.out, "{description}")?;
        tracing::info!(source, shown = excerpt.shown, total = excerpt.total, "analyzing log");

        let prompt = analysis_prompt(source, &excerpt);
        let request = CompletionRequest::new(
            self.request_ids.next(),
            vec![ChatMessage::system(SRE_SYSTEM_PROMPT), ChatMessage::user(prompt)],
        )
        .with_model(self.planner.model.clone())
        .with_temperature(LOG_ANALYSIS_TEMPERATURE);

        let report = self.stream_reply(request, true)?;
        writeln!(self.out)?;

        self.store.append(SessionEntryKind::ChatTurn {
            role: ChatRole::User,
            content: description,
        })?;
        self.store.append(SessionEntryKind::ChatTurn {
            role: ChatRole::Assistant,
            content: report.clone(),
        })?;
        Ok(report)
    }
}
