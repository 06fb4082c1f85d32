use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use agent_plan::{
    ErrorKind, Plan, ProposedStep, ResourceRef, StepStatus, ToolInvocationResult, ToolKind,
};
use agent_provider::ChatRole;
use serde_json::{json, Map};
use session_store::{
    ReplayViolation, SessionEntryKind, SessionHeader, SessionSelector, SessionStore,
    SessionStoreError,
};
use tempfile::TempDir;

fn write_session_file(lines: &[String]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("2026-02-14T00-00-00Z_session-1.jsonl");
    let mut file = File::create(&path).expect("session file should be created");

    for line in lines {
        writeln!(file, "{line}").expect("line should be written");
    }

    (dir, path)
}

fn header_line(cwd: &Path) -> String {
    json!({
        "type": "session",
        "version": 1,
        "session_id": "session-1",
        "created_at": "2026-02-14T00:00:00Z",
        "cwd": cwd.display().to_string(),
    })
    .to_string()
}

fn task_line(seq: u64, task_id: &str, text: &str) -> String {
    json!({
        "type": "entry",
        "seq": seq,
        "ts": "2026-02-14T00:00:01Z",
        "kind": "task",
        "task_id": task_id,
        "text": text,
    })
    .to_string()
}

fn chat_line(seq: u64, role: &str, content: &str) -> String {
    json!({
        "type": "entry",
        "seq": seq,
        "ts": "2026-02-14T00:00:02Z",
        "kind": "chat_turn",
        "role": role,
        "content": content,
    })
    .to_string()
}

fn plan(task_id: &str) -> Plan {
    let step = |tool, path: &str| {
        let mut parameters = Map::new();
        parameters.insert("path".to_string(), json!(path));
        ProposedStep {
            tool,
            parameters,
            rationale: format!("touch {path}"),
        }
    };
    Plan::new(
        task_id,
        "read then write",
        vec![step(ToolKind::ReadFile, "m.py"), step(ToolKind::WriteFile, "m.py")],
    )
    .expect("plan should build")
}

fn step_result(
    task_id: &str,
    step_id: u32,
    status: StepStatus,
    attempts: Vec<ToolInvocationResult>,
) -> SessionEntryKind {
    SessionEntryKind::StepResult {
        task_id: task_id.to_string(),
        step_id,
        status,
        rejected: false,
        attempts,
        diff: None,
        reason: None,
    }
}

#[test]
fn open_rejects_empty_file() {
    let (_dir, path) = write_session_file(&[]);

    let error = SessionStore::open(&path)
        .err()
        .expect("empty file must fail");
    assert!(matches!(error, SessionStoreError::MissingHeader { .. }));
}

#[test]
fn open_rejects_non_header_first_line() {
    let (_dir, path) = write_session_file(&[task_line(1, "t1", "hello")]);

    let error = SessionStore::open(&path)
        .err()
        .expect("entry as first line must fail");
    assert!(matches!(
        error,
        SessionStoreError::InvalidHeaderRecord { line: 1, .. }
    ));
}

#[test]
fn open_rejects_unsupported_header_version() {
    let (_dir, path) = write_session_file(&[json!({
        "type": "session",
        "version": 2,
        "session_id": "session-1",
        "created_at": "2026-02-14T00:00:00Z",
        "cwd": "/tmp",
    })
    .to_string()]);

    let error = SessionStore::open(&path)
        .err()
        .expect("unsupported version must fail");
    assert!(matches!(
        error,
        SessionStoreError::UnsupportedVersion {
            line: 1,
            found: 2,
            ..
        }
    ));
}

#[test]
fn open_rejects_unknown_header_fields() {
    let (_dir, path) = write_session_file(&[json!({
        "type": "session",
        "version": 1,
        "session_id": "session-1",
        "created_at": "2026-02-14T00:00:00Z",
        "cwd": "/tmp",
        "unexpected": true,
    })
    .to_string()]);

    let error = SessionStore::open(&path)
        .err()
        .expect("unknown header field must fail");
    assert!(matches!(
        error,
        SessionStoreError::JsonLineParse { line: 1, .. }
    ));
}

#[test]
fn open_rejects_malformed_json_line_with_line_context() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let (_dir, path) = write_session_file(&[
        header_line(temp.path()),
        "{ this is invalid json".to_string(),
    ]);

    let error = SessionStore::open(&path)
        .err()
        .expect("malformed json line must fail");
    assert!(matches!(
        error,
        SessionStoreError::JsonLineParse { line: 2, .. }
    ));
}

#[test]
fn open_rejects_unknown_entry_fields_and_kinds() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let mut extra = serde_json::from_str::<serde_json::Value>(&task_line(1, "t1", "x"))
        .expect("task line is json");
    extra["extra"] = json!("nope");
    let (_dir, path) = write_session_file(&[header_line(temp.path()), extra.to_string()]);

    let error = SessionStore::open(&path)
        .err()
        .expect("unknown entry field must fail");
    assert!(matches!(
        error,
        SessionStoreError::JsonLineParse { line: 2, .. }
    ));

    let (_dir, path) = write_session_file(&[
        header_line(temp.path()),
        json!({
            "type": "entry",
            "seq": 1,
            "ts": "2026-02-14T00:00:01Z",
            "kind": "tool_call",
        })
        .to_string(),
    ]);
    let error = SessionStore::open(&path)
        .err()
        .expect("unknown entry kind must fail");
    assert!(matches!(
        error,
        SessionStoreError::JsonLineParse { line: 2, .. }
    ));
}

#[test]
fn open_rejects_non_monotonic_seq() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let (_dir, path) = write_session_file(&[
        header_line(temp.path()),
        task_line(1, "t1", "first"),
        chat_line(1, "user", "again"),
    ]);

    let error = SessionStore::open(&path)
        .err()
        .expect("repeated seq must fail");
    assert!(matches!(
        error,
        SessionStoreError::Replay {
            line: 3,
            violation: ReplayViolation::NonMonotonicSeq {
                expected: 2,
                found: 1
            },
            ..
        }
    ));
}

#[test]
fn open_rejects_invalid_entry_timestamp() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let mut line = serde_json::from_str::<serde_json::Value>(&task_line(1, "t1", "x"))
        .expect("task line is json");
    line["ts"] = json!("yesterday");
    let (_dir, path) = write_session_file(&[header_line(temp.path()), line.to_string()]);

    let error = SessionStore::open(&path)
        .err()
        .expect("bad timestamp must fail");
    assert!(matches!(
        error,
        SessionStoreError::InvalidTimestamp {
            line: 2,
            field: "ts",
            ..
        }
    ));
}

#[test]
fn open_drops_torn_tail_and_appends_after_valid_prefix() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let (_dir, path) = write_session_file(&[
        header_line(temp.path()),
        task_line(1, "t1", "survives"),
    ]);
    let mut file = OpenOptions::new()
        .append(true)
        .open(&path)
        .expect("reopen for append");
    write!(file, "{{\"type\":\"entry\",\"seq\":2,\"ts\":\"2026-02").expect("torn write");
    drop(file);

    let mut store = SessionStore::open(&path).expect("torn tail is tolerated");
    assert_eq!(store.session().entry_count(), 1);
    assert_eq!(store.session().task_history[0].text, "survives");

    let seq = store
        .append(SessionEntryKind::ChatTurn {
            role: ChatRole::User,
            content: "after crash".to_string(),
        })
        .expect("append after torn tail");
    assert_eq!(seq, 2);

    let reopened = SessionStore::open(&path).expect("log is valid again");
    assert_eq!(reopened.session().chat.len(), 1);
    assert_eq!(
        std::fs::read_to_string(&path)
            .expect("read log")
            .lines()
            .count(),
        3
    );
}

#[test]
fn create_new_uses_cwd_agent_sessions_root_and_writes_header() {
    let cwd_dir = tempfile::tempdir().expect("tempdir should be created");
    let store = SessionStore::create_new(cwd_dir.path()).expect("create_new should succeed");

    let expected_root = cwd_dir.path().join(".agent").join("sessions");
    assert!(store.path().starts_with(&expected_root));

    let file = std::fs::read_to_string(store.path()).expect("session file should be readable");
    let mut lines = file.lines();
    let header_line = lines.next().expect("header line should exist");
    let parsed_header: SessionHeader =
        serde_json::from_str(header_line).expect("header should deserialize");

    assert_eq!(parsed_header.version, 1);
    assert_eq!(parsed_header.session_id, store.header().session_id);
    assert_eq!(parsed_header.cwd, cwd_dir.path().display().to_string());
    assert!(lines.next().is_none());
}

#[test]
fn create_new_rejects_relative_cwd() {
    let error = SessionStore::create_new(Path::new("relative/dir"))
        .err()
        .expect("relative cwd must fail");
    assert!(matches!(
        error,
        SessionStoreError::NonAbsoluteCreateCwd { .. }
    ));
}

#[test]
fn create_new_fails_when_session_root_is_unwritable() {
    let cwd_dir = tempfile::tempdir().expect("tempdir should be created");
    std::fs::write(cwd_dir.path().join(".agent"), "file blocks directory creation")
        .expect("blocker file should be created");

    let error = SessionStore::create_new(cwd_dir.path())
        .err()
        .expect("create_new should fail when session root cannot be created");

    assert!(matches!(error, SessionStoreError::Io { .. }));
}

#[test]
fn append_then_load_replays_plan_statuses_and_attempts() {
    let cwd_dir = tempfile::tempdir().expect("tempdir should be created");
    let mut store = SessionStore::create_new(cwd_dir.path()).expect("create_new should succeed");

    store
        .append(SessionEntryKind::Task {
            task_id: "t1".to_string(),
            text: "add a docstring to f in m.py".to_string(),
        })
        .expect("task");
    store
        .append(SessionEntryKind::Plan {
            task_id: "t1".to_string(),
            plan: plan("t1"),
        })
        .expect("plan");
    store
        .append(step_result(
            "t1",
            0,
            StepStatus::Executed,
            vec![ToolInvocationResult::success(0, "def f(): pass\n")],
        ))
        .expect("step 0");
    store
        .append(step_result(
            "t1",
            1,
            StepStatus::Failed,
            vec![
                ToolInvocationResult::failure(1, ErrorKind::Timeout, "slow"),
                ToolInvocationResult::failure(1, ErrorKind::Timeout, "slow again").with_attempt(2),
            ],
        ))
        .expect("step 1");

    let root = cwd_dir.path().join(".agent").join("sessions");
    let loaded = SessionStore::load(&root, &SessionSelector::Latest).expect("load latest");
    let session = loaded.session();

    assert_eq!(session.id, store.id());
    assert_eq!(session.task_history.len(), 1);
    let statuses = session.plans["t1"]
        .steps()
        .iter()
        .map(|step| step.status)
        .collect::<Vec<_>>();
    assert_eq!(statuses, vec![StepStatus::Executed, StepStatus::Failed]);
    assert_eq!(
        session
            .results
            .iter()
            .map(|result| result.attempt)
            .collect::<Vec<_>>(),
        vec![1, 1, 2]
    );
    assert_eq!(session, store.session());
}

#[test]
fn append_rejects_out_of_order_entries_without_writing() {
    let cwd_dir = tempfile::tempdir().expect("tempdir should be created");
    let mut store = SessionStore::create_new(cwd_dir.path()).expect("create_new should succeed");

    let error = store
        .append(SessionEntryKind::Plan {
            task_id: "missing".to_string(),
            plan: plan("missing"),
        })
        .expect_err("plan without task must fail");
    assert!(matches!(
        error,
        SessionStoreError::Replay {
            violation: ReplayViolation::UnknownTask { .. },
            ..
        }
    ));

    let file = std::fs::read_to_string(store.path()).expect("session file should be readable");
    assert_eq!(file.lines().count(), 1, "only the header is on disk");
    assert_eq!(store.session().entry_count(), 0);
}

#[test]
fn step_results_carry_side_effects_and_diff() {
    let cwd_dir = tempfile::tempdir().expect("tempdir should be created");
    let mut store = SessionStore::create_new(cwd_dir.path()).expect("create_new should succeed");
    store
        .append(SessionEntryKind::Task {
            task_id: "t1".to_string(),
            text: "edit".to_string(),
        })
        .expect("task");
    store
        .append(SessionEntryKind::Plan {
            task_id: "t1".to_string(),
            plan: plan("t1"),
        })
        .expect("plan");
    store
        .append(SessionEntryKind::StepResult {
            task_id: "t1".to_string(),
            step_id: 0,
            status: StepStatus::Skipped,
            rejected: true,
            attempts: Vec::new(),
            diff: None,
            reason: Some("rejected by user".to_string()),
        })
        .expect("rejected step");
    store
        .append(SessionEntryKind::StepResult {
            task_id: "t1".to_string(),
            step_id: 1,
            status: StepStatus::Executed,
            rejected: false,
            attempts: vec![ToolInvocationResult::success(1, "Wrote m.py").with_side_effect(
                ResourceRef::File {
                    path: "m.py".to_string(),
                },
            )],
            diff: Some("--- a/m.py\n+++ b/m.py\n".to_string()),
            reason: None,
        })
        .expect("executed step");

    let raw = std::fs::read_to_string(store.path()).expect("read");
    let last: serde_json::Value =
        serde_json::from_str(raw.lines().last().expect("last line")).expect("json");
    assert_eq!(last["kind"], "step_result");
    assert_eq!(last["seq"], 4);
    assert_eq!(last["attempts"][0]["side_effects"][0]["kind"], "file");
    assert!(last["diff"].as_str().is_some_and(|diff| diff.contains("+++ b/m.py")));

    let reopened = SessionStore::open(store.path()).expect("reopen");
    assert_eq!(reopened.session().results.len(), 1);
}

#[test]
fn list_orders_newest_first_and_skips_garbage() {
    let root_dir = tempfile::tempdir().expect("tempdir should be created");
    let root = root_dir.path();
    let lines = |id: &str, created_at: &str| {
        vec![
            json!({
                "type": "session",
                "version": 1,
                "session_id": id,
                "created_at": created_at,
                "cwd": "/work",
            })
            .to_string(),
            task_line(1, "t1", &format!("task in {id}")),
        ]
    };
    for (id, created_at) in [
        ("older", "2026-01-01T00:00:00Z"),
        ("newer", "2026-03-01T00:00:00+02:00"),
    ] {
        let path = root.join(session_store::session_file_name(created_at, id));
        let mut file = File::create(&path).expect("create");
        for line in lines(id, created_at) {
            writeln!(file, "{line}").expect("write");
        }
    }
    std::fs::write(root.join("2026-02-01_broken.jsonl"), "not json\n").expect("garbage");

    let summaries = SessionStore::list(root).expect("list");
    let ids = summaries
        .iter()
        .map(|summary| summary.id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["newer", "older"]);
    assert_eq!(summaries[0].task_count, 1);
    assert_eq!(summaries[0].entry_count, 1);
    assert_eq!(summaries[0].last_task.as_deref(), Some("task in newer"));

    let latest = SessionStore::load(root, &SessionSelector::Latest).expect("latest");
    assert_eq!(latest.id(), "newer");
}

#[test]
fn load_by_id_accepts_unique_prefix() {
    let root_dir = tempfile::tempdir().expect("tempdir should be created");
    let cwd = root_dir.path();
    let root = cwd.join("sessions");
    let first = SessionStore::create_in(&root, cwd).expect("first");
    let second = SessionStore::create_in(&root, cwd).expect("second");

    let by_full = SessionStore::load(&root, &SessionSelector::Id(first.id().to_string()))
        .expect("full id");
    assert_eq!(by_full.id(), first.id());

    let prefix = &second.id()[..8];
    if !first.id().starts_with(prefix) {
        let by_prefix =
            SessionStore::load(&root, &SessionSelector::Id(prefix.to_string())).expect("prefix");
        assert_eq!(by_prefix.id(), second.id());
    }

    let error = SessionStore::load(&root, &SessionSelector::Id("zzzz".to_string()))
        .expect_err("unknown id");
    assert!(matches!(error, SessionStoreError::UnknownSession { .. }));
}

#[test]
fn load_latest_in_empty_root_reports_no_sessions() {
    let root_dir = tempfile::tempdir().expect("tempdir should be created");
    let error = SessionStore::load(root_dir.path(), &SessionSelector::Latest)
        .expect_err("nothing to load");
    assert!(matches!(error, SessionStoreError::NoSessionsFound { .. }));
}

#[test]
fn selector_parses_latest_keyword() {
    assert_eq!(
        "latest".parse::<SessionSelector>(),
        Ok(SessionSelector::Latest)
    );
    assert_eq!(
        "abc".parse::<SessionSelector>(),
        Ok(SessionSelector::Id("abc".to_string()))
    );
}

fn planned_store() -> (TempDir, SessionStore) {
    let cwd_dir = tempfile::tempdir().expect("tempdir should be created");
    let mut store = SessionStore::create_new(cwd_dir.path()).expect("create_new should succeed");
    store
        .append(SessionEntryKind::Task {
            task_id: "t1".to_string(),
            text: "edit".to_string(),
        })
        .expect("task");
    store
        .append(SessionEntryKind::Plan {
            task_id: "t1".to_string(),
            plan: plan("t1"),
        })
        .expect("plan");
    (cwd_dir, store)
}

fn replay_violation(error: SessionStoreError) -> ReplayViolation {
    match error {
        SessionStoreError::Replay { violation, .. } => violation,
        other => panic!("expected a replay violation, got {other:?}"),
    }
}

#[test]
fn executed_step_without_attempts_is_rejected() {
    let (_dir, mut store) = planned_store();

    let error = store
        .append(step_result("t1", 0, StepStatus::Executed, Vec::new()))
        .expect_err("an executed step must carry its attempt");

    assert_eq!(
        replay_violation(error),
        ReplayViolation::MissingAttempts {
            step_id: 0,
            status: StepStatus::Executed,
        }
    );
    assert_eq!(store.session().entry_count(), 2);
}

#[test]
fn skipped_step_with_attempts_is_rejected() {
    let (_dir, mut store) = planned_store();

    let error = store
        .append(step_result(
            "t1",
            0,
            StepStatus::Skipped,
            vec![ToolInvocationResult::success(0, "ran anyway")],
        ))
        .expect_err("a skipped step never ran");

    assert_eq!(
        replay_violation(error),
        ReplayViolation::SkippedWithAttempts {
            step_id: 0,
            count: 1,
        }
    );
}

#[test]
fn attempts_must_be_numbered_from_one() {
    let (_dir, mut store) = planned_store();

    let error = store
        .append(step_result(
            "t1",
            0,
            StepStatus::Failed,
            vec![
                ToolInvocationResult::failure(0, ErrorKind::Timeout, "slow"),
                ToolInvocationResult::failure(0, ErrorKind::Timeout, "slow again"),
            ],
        ))
        .expect_err("the retry must be attempt 2");

    assert_eq!(
        replay_violation(error),
        ReplayViolation::AttemptOutOfSequence {
            step_id: 0,
            expected: 2,
            found: 1,
        }
    );

    let error = store
        .append(step_result(
            "t1",
            0,
            StepStatus::Executed,
            vec![ToolInvocationResult::success(0, "ok").with_attempt(3)],
        ))
        .expect_err("the first attempt is attempt 1");
    assert!(matches!(
        replay_violation(error),
        ReplayViolation::AttemptOutOfSequence {
            expected: 1,
            found: 3,
            ..
        }
    ));
}

#[test]
fn status_must_agree_with_the_last_attempt() {
    let (_dir, mut store) = planned_store();

    let error = store
        .append(step_result(
            "t1",
            0,
            StepStatus::Executed,
            vec![ToolInvocationResult::failure(0, ErrorKind::Io, "broken")],
        ))
        .expect_err("a failed attempt cannot settle as executed");

    assert_eq!(
        replay_violation(error),
        ReplayViolation::OutcomeMismatch {
            step_id: 0,
            status: StepStatus::Executed,
        }
    );
}

#[test]
fn loading_a_file_with_an_attemptless_result_fails() {
    let cwd = tempfile::tempdir().expect("tempdir should be created");
    let plan_line = json!({
        "type": "entry",
        "seq": 2,
        "ts": "2026-02-14T00:00:02Z",
        "kind": "plan",
        "task_id": "t1",
        "plan": plan("t1"),
    })
    .to_string();
    let result_line = json!({
        "type": "entry",
        "seq": 3,
        "ts": "2026-02-14T00:00:03Z",
        "kind": "step_result",
        "task_id": "t1",
        "step_id": 0,
        "status": "executed",
        "attempts": [],
    })
    .to_string();
    let (_dir, path) = write_session_file(&[
        header_line(cwd.path()),
        task_line(1, "t1", "edit"),
        plan_line,
        result_line,
    ]);

    let error = SessionStore::open(&path)
        .err()
        .expect("replay must fail");

    assert!(matches!(
        error,
        SessionStoreError::Replay {
            violation: ReplayViolation::MissingAttempts { step_id: 0, .. },
            ..
        }
    ));
}
