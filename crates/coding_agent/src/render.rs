//! Text views over saved sessions.

use std::fmt::Write as _;

use session_store::{Session, SessionSummary};

use crate::summary::render_plan_status;

const LAST_TASK_CHARS: usize = 60;
const RESULT_OUTPUT_CHARS: usize = 120;

#[must_use]
pub fn render_session_list(sessions: &[SessionSummary]) -> String {
    if sessions.is_empty() {
        return "No sessions yet.\n".to_string();
    }

    let mut text = String::new();
    for session in sessions {
        let _ = write!(
            text,
            "{}  {}  {} tasks  {} entries",
            session.id, session.created_at, session.task_count, session.entry_count
        );
        if let Some(task) = &session.last_task {
            let _ = write!(text, "  {}", clip(task, LAST_TASK_CHARS));
        }
        text.push('\n');
    }
    text
}

/// Tasks with their plan statuses and attempt results, then the chat.
#[must_use]
pub fn render_session(session: &Session) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Session {} ({})", session.id, session.created_at);
    let _ = writeln!(text, "cwd: {}", session.cwd);

    for task in &session.task_history {
        let _ = writeln!(text, "\n{}: {}", task.id, task.text);
        let Some(plan) = session.plans.get(&task.id) else {
            text.push_str("  (no plan)\n");
            continue;
        };
        text.push_str(&render_plan_status(plan));

        for result in session.results_for(&task.id) {
            let outcome = match (result.ok, result.error) {
                (true, _) => "ok".to_string(),
                (false, Some(error)) => error.to_string(),
                (false, None) => "failed".to_string(),
            };
            let _ = writeln!(
                text,
                "    step {} attempt {}: {}  {}",
                result.step_id,
                result.attempt,
                outcome,
                clip(&result.output, RESULT_OUTPUT_CHARS)
            );
        }
    }

    if !session.chat.is_empty() {
        text.push_str("\nChat:\n");
        for message in &session.chat {
            let _ = writeln!(text, "  {}: {}", message.role.as_str(), message.content);
        }
    }
    text
}

fn clip(text: &str, max_chars: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    let mut clipped = single_line.chars().take(max_chars).collect::<String>();
    clipped.push_str("...");
    clipped
}
