use agent_plan::{Plan, StepId, StepStatus, TaskId, ToolInvocationResult};
use agent_provider::ChatRole;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SESSION_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRecordType {
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRecordType {
    Entry,
}

/// First line of every session file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionHeader {
    #[serde(rename = "type")]
    pub record_type: SessionRecordType,
    pub version: u32,
    pub session_id: String,
    pub created_at: String,
    pub cwd: String,
}

impl SessionHeader {
    #[must_use]
    pub fn v1(
        session_id: impl Into<String>,
        created_at: impl Into<String>,
        cwd: impl Into<String>,
    ) -> Self {
        Self {
            record_type: SessionRecordType::Session,
            version: SESSION_VERSION,
            session_id: session_id.into(),
            created_at: created_at.into(),
            cwd: cwd.into(),
        }
    }
}

/// One appended record. `seq` starts at 1 and increases by exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    #[serde(rename = "type")]
    pub record_type: EntryRecordType,
    pub seq: u64,
    pub ts: String,
    #[serde(flatten)]
    pub kind: SessionEntryKind,
}

impl SessionEntry {
    #[must_use]
    pub fn new(seq: u64, ts: impl Into<String>, kind: SessionEntryKind) -> Self {
        Self {
            record_type: EntryRecordType::Entry,
            seq,
            ts: ts.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum SessionEntryKind {
    Task {
        task_id: TaskId,
        text: String,
    },
    Plan {
        task_id: TaskId,
        plan: Plan,
    },
    /// Written once per step when it reaches a terminal status.
    StepResult {
        task_id: TaskId,
        step_id: StepId,
        status: StepStatus,
        /// The step passed through `Rejected` on its way to `Skipped`.
        #[serde(default, skip_serializing_if = "is_false")]
        rejected: bool,
        /// One result per attempt, oldest first. Empty for skipped steps.
        #[serde(default)]
        attempts: Vec<ToolInvocationResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ChatTurn {
        role: ChatRole,
        content: String,
    },
}

impl SessionEntryKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task { .. } => "task",
            Self::Plan { .. } => "plan",
            Self::StepResult { .. } => "step_result",
            Self::ChatTurn { .. } => "chat_turn",
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JsonLine {
    Session(SessionHeader),
    Entry(SessionEntry),
}

impl JsonLine {
    /// Dispatches on the `type` discriminator, then decodes the full record.
    pub(crate) fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        let record_type = value
            .get("type")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        match record_type.as_deref() {
            Some("session") => serde_json::from_value(value).map(Self::Session),
            Some("entry") => serde_json::from_value(value).map(Self::Entry),
            Some(other) => Err(serde::de::Error::unknown_variant(other, &["session", "entry"])),
            None => Err(serde::de::Error::missing_field("type")),
        }
    }
}
