#![allow(dead_code)]

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use agent_provider::{cancel_signal, CancelSignal};
use agent_provider_mock::ScriptedProvider;
use coding_agent::agent::Agent;
use coding_agent::planner::PlannerOptions;
use coding_agent::providers::RequestIds;
use coding_agent::safety::{Allowlist, ConfirmationResponse, SafetyGate, ScriptedConfirmer};
use coding_agent::tools::ToolRegistry;
use serde_json::{json, Value};
use session_store::{SessionSelector, SessionStore};
use tempfile::TempDir;

/// A scratch workspace with a session log, scripted model replies and
/// scripted confirmation answers.
pub struct Harness {
    pub workspace: TempDir,
    pub session_root: PathBuf,
    pub store: SessionStore,
    pub tools: ToolRegistry,
    pub provider: ScriptedProvider,
    pub confirmer: ScriptedConfirmer,
    pub request_ids: RequestIds,
    pub cancel: CancelSignal,
    pub out: Vec<u8>,
}

impl Harness {
    pub fn new(
        replies: Vec<String>,
        responses: impl IntoIterator<Item = ConfirmationResponse>,
    ) -> Self {
        let workspace = tempfile::tempdir().expect("temp workspace");
        let session_root = workspace.path().join(".agent").join("sessions");
        let store = SessionStore::create_in(&session_root, workspace.path()).expect("create session");
        let tools = ToolRegistry::new(workspace.path())
            .expect("workspace root should be valid")
            .excluding(&session_root);

        Self {
            workspace,
            session_root,
            store,
            tools,
            provider: ScriptedProvider::new(replies),
            confirmer: ScriptedConfirmer::new(responses),
            request_ids: RequestIds::default(),
            cancel: cancel_signal(),
            out: Vec::new(),
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.workspace.path().join(relative)
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("seed file");
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.path(relative)).expect("read workspace file")
    }

    pub fn agent(&mut self, allowlist: Allowlist, approve_all: bool) -> Agent<'_> {
        Agent {
            provider: &self.provider,
            tools: &mut self.tools,
            gate: SafetyGate::new(allowlist, approve_all),
            confirmer: &mut self.confirmer,
            store: &mut self.store,
            request_ids: &self.request_ids,
            cancel: self.cancel.clone(),
            out: &mut self.out,
            workspace_root: self.workspace.path().to_path_buf(),
            planner: PlannerOptions {
                max_steps: 12,
                model: None,
            },
        }
    }

    /// Same as [`Harness::agent`] but reporting to `out`.
    pub fn agent_writing_to<'a>(&'a mut self, approve_all: bool, out: &'a mut dyn Write) -> Agent<'a> {
        Agent {
            provider: &self.provider,
            tools: &mut self.tools,
            gate: SafetyGate::new(Allowlist::default(), approve_all),
            confirmer: &mut self.confirmer,
            store: &mut self.store,
            request_ids: &self.request_ids,
            cancel: self.cancel.clone(),
            out,
            workspace_root: self.workspace.path().to_path_buf(),
            planner: PlannerOptions {
                max_steps: 12,
                model: None,
            },
        }
    }

    pub fn output(&self) -> String {
        String::from_utf8(self.out.clone()).expect("utf8 output")
    }

    /// Replays the session file from disk.
    pub fn reload(&self) -> SessionStore {
        SessionStore::load(
            &self.session_root,
            &SessionSelector::Id(self.store.id().to_string()),
        )
        .expect("reload session")
    }
}

/// A model reply holding one plan.
pub fn plan_reply(summary: &str, steps: Value) -> String {
    json!({ "summary": summary, "steps": steps }).to_string()
}

/// A terminal that has gone away.
pub struct ClosedOutput;

impl Write for ClosedOutput {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "output closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
