//! Tool registry: the boundary between what the model proposes and what the
//! host does.
//!
//! Every invocation yields a [`ToolInvocationResult`]; tool failures never
//! surface as Rust errors. Paths are resolved inside the workspace root and
//! anything that escapes it (lexically or through a symlink) is
//! [`ErrorKind::InvalidPath`].

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use agent_plan::{ErrorKind, ResourceRef, StepId, ToolInvocationResult, ToolKind};
use agent_provider::{is_cancelled, CancelSignal, ToolSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::instrument;
use wait_timeout::ChildExt;
use walkdir::WalkDir;

pub const DEFAULT_SHELL_TIMEOUT_SEC: u64 = 120;
pub const DEFAULT_SHELL_MAX_OUTPUT_BYTES: usize = 100 * 1024;
pub const DEFAULT_READ_MAX_BYTES: usize = 200 * 1024;
pub const SEARCH_MATCH_LIMIT: usize = 100;

const SHELL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SEARCH_SKIP_DIRS: [&str; 4] = [".git", "target", "node_modules", ".agent"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Overwrite,
    Create,
}

/// Typed form of a plan step's parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
        mode: WriteMode,
    },
    SearchText {
        query: String,
        scope: String,
    },
    RunShellCommand {
        command: String,
        timeout_sec: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid parameters for {tool}: {message}")]
pub struct ParameterError {
    pub tool: ToolKind,
    pub message: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadFileParams {
    path: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteFileParams {
    path: String,
    content: String,
    #[serde(default)]
    mode: WriteMode,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchTextParams {
    query: String,
    #[serde(default = "default_scope")]
    scope: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RunShellCommandParams {
    command: String,
    timeout_sec: Option<u64>,
}

fn default_scope() -> String {
    ".".to_string()
}

impl ToolCall {
    /// Decodes step parameters for `tool`. Unknown keys are rejected.
    pub fn from_step(tool: ToolKind, parameters: &Map<String, Value>) -> Result<Self, ParameterError> {
        let value = Value::Object(parameters.clone());
        let call = match tool {
            ToolKind::ReadFile => {
                let params: ReadFileParams = decode(tool, value)?;
                Self::ReadFile { path: params.path }
            }
            ToolKind::WriteFile => {
                let params: WriteFileParams = decode(tool, value)?;
                Self::WriteFile {
                    path: params.path,
                    content: params.content,
                    mode: params.mode,
                }
            }
            ToolKind::SearchText => {
                let params: SearchTextParams = decode(tool, value)?;
                if params.query.is_empty() {
                    return Err(ParameterError {
                        tool,
                        message: "query must not be empty".to_string(),
                    });
                }
                Self::SearchText {
                    query: params.query,
                    scope: params.scope,
                }
            }
            ToolKind::RunShellCommand => {
                let params: RunShellCommandParams = decode(tool, value)?;
                if params.command.trim().is_empty() {
                    return Err(ParameterError {
                        tool,
                        message: "command must not be empty".to_string(),
                    });
                }
                if params.timeout_sec == Some(0) {
                    return Err(ParameterError {
                        tool,
                        message: "timeout_sec must be greater than 0".to_string(),
                    });
                }
                Self::RunShellCommand {
                    command: params.command,
                    timeout_sec: params.timeout_sec,
                }
            }
        };
        Ok(call)
    }

    #[must_use]
    pub fn kind(&self) -> ToolKind {
        match self {
            Self::ReadFile { .. } => ToolKind::ReadFile,
            Self::WriteFile { .. } => ToolKind::WriteFile,
            Self::SearchText { .. } => ToolKind::SearchText,
            Self::RunShellCommand { .. } => ToolKind::RunShellCommand,
        }
    }
}

fn decode<T: DeserializeOwned>(tool: ToolKind, value: Value) -> Result<T, ParameterError> {
    serde_json::from_value(value).map_err(|error| ParameterError {
        tool,
        message: error.to_string(),
    })
}

/// Declared schemas for every tool, in [`ToolKind::ALL`] order.
#[must_use]
pub fn tool_schemas() -> Vec<ToolSchema> {
    ToolKind::ALL.into_iter().map(tool_schema).collect()
}

#[must_use]
pub fn tool_schema(tool: ToolKind) -> ToolSchema {
    let (description, input_schema) = match tool {
        ToolKind::ReadFile => (
            "Read a UTF-8 text file inside the workspace.",
            json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["path"],
                "properties": {
                    "path": {"type": "string", "minLength": 1}
                }
            }),
        ),
        ToolKind::WriteFile => (
            "Write the complete new content of a file inside the workspace. \
             mode=create fails if the file exists.",
            json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["path", "content"],
                "properties": {
                    "path": {"type": "string", "minLength": 1},
                    "content": {"type": "string"},
                    "mode": {"enum": ["overwrite", "create"]}
                }
            }),
        ),
        ToolKind::SearchText => (
            "Find lines containing a literal string in files under scope.",
            json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["query"],
                "properties": {
                    "query": {"type": "string", "minLength": 1},
                    "scope": {"type": "string", "minLength": 1}
                }
            }),
        ),
        ToolKind::RunShellCommand => (
            "Run a shell command in the workspace (tests, linters, builds).",
            json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["command"],
                "properties": {
                    "command": {"type": "string", "minLength": 1},
                    "timeout_sec": {"type": "integer", "minimum": 1}
                }
            }),
        ),
    };

    ToolSchema {
        name: tool.name().to_string(),
        description: description.to_string(),
        input_schema,
    }
}

/// A tool failure detected before or while acting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ToolFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl ToolFailure {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn io(action: &str, path: &Path, error: &std::io::Error) -> Self {
        Self::new(
            ErrorKind::from_io(error),
            format!("Failed to {action} {}: {error}", path.display()),
        )
    }

    #[must_use]
    pub fn into_result(self, step_id: StepId) -> ToolInvocationResult {
        ToolInvocationResult::failure(step_id, self.kind, self.message)
    }
}

/// What the executor needs from a tool host.
pub trait ToolRunner {
    fn invoke(
        &mut self,
        step_id: StepId,
        call: &ToolCall,
        cancel: &CancelSignal,
    ) -> ToolInvocationResult;

    /// Unified diff the write would produce, without writing.
    fn preview_write(&self, path: &str, content: &str, mode: WriteMode)
        -> Result<String, ToolFailure>;
}

/// Captured subprocess outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutcome {
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

/// Restartable literal search. Each call to [`SearchQuery::matches`] walks
/// the tree again from the start.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    workspace_root: PathBuf,
    scope: PathBuf,
    query: String,
    excluded: Vec<PathBuf>,
}

impl SearchQuery {
    #[must_use]
    pub fn matches(&self) -> SearchMatches {
        let excluded = self.excluded.clone();
        let walker = WalkDir::new(&self.scope)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                let skip_name = entry.depth() > 0
                    && entry.file_type().is_dir()
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| SEARCH_SKIP_DIRS.contains(&name));
                !skip_name && !excluded.iter().any(|dir| entry.path() == dir)
            });

        SearchMatches {
            walker: Box::new(walker),
            workspace_root: self.workspace_root.clone(),
            query: self.query.clone(),
            pending: Vec::new().into_iter(),
        }
    }
}

/// Lazy sequence of matches; files are read one at a time as the iterator
/// advances.
pub struct SearchMatches {
    walker: Box<dyn Iterator<Item = walkdir::Result<walkdir::DirEntry>>>,
    workspace_root: PathBuf,
    query: String,
    pending: std::vec::IntoIter<SearchMatch>,
}

impl Iterator for SearchMatches {
    type Item = SearchMatch;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(found) = self.pending.next() {
                return Some(found);
            }

            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(error) => {
                    tracing::debug!(%error, "skipping unreadable search entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(text) = fs::read_to_string(entry.path()) else {
                continue;
            };

            let shown = relative_display(&self.workspace_root, entry.path());
            let found = text
                .lines()
                .enumerate()
                .filter(|(_, line)| line.contains(&self.query))
                .map(|(index, line)| SearchMatch {
                    path: shown.clone(),
                    line: index + 1,
                    text: line.to_string(),
                })
                .collect::<Vec<_>>();
            self.pending = found.into_iter();
        }
    }
}

/// Built-in implementation of the four tools over one workspace.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    workspace_root: PathBuf,
    default_shell_timeout: Duration,
    shell_max_output_bytes: usize,
    read_max_bytes: usize,
    excluded_dirs: Vec<PathBuf>,
    /// Content hash per file as last read or written by this session.
    snapshots: HashMap<PathBuf, String>,
}

impl ToolRegistry {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Result<Self, String> {
        let workspace_root = workspace_root.into();
        let canonical_root = workspace_root
            .canonicalize()
            .map_err(|err| format!("Failed to resolve workspace root: {err}"))?;

        if !canonical_root.is_dir() {
            return Err("Workspace root must be a directory".to_string());
        }

        Ok(Self {
            workspace_root: canonical_root,
            default_shell_timeout: Duration::from_secs(DEFAULT_SHELL_TIMEOUT_SEC),
            shell_max_output_bytes: DEFAULT_SHELL_MAX_OUTPUT_BYTES,
            read_max_bytes: DEFAULT_READ_MAX_BYTES,
            excluded_dirs: Vec::new(),
            snapshots: HashMap::new(),
        })
    }

    #[must_use]
    pub fn with_shell_timeout(mut self, timeout: Duration) -> Self {
        self.default_shell_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_read_max_bytes(mut self, max_bytes: usize) -> Self {
        self.read_max_bytes = max_bytes;
        self
    }

    /// Keeps `dir` (typically the session directory) out of searches.
    #[must_use]
    pub fn excluding(mut self, dir: &Path) -> Self {
        let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        self.excluded_dirs.push(dir);
        self
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    fn read_file(&mut self, step_id: StepId, path: &str) -> ToolInvocationResult {
        let resolved = match self.resolve_existing_path(path) {
            Ok(path) => path,
            Err(failure) => return failure.into_result(step_id),
        };

        let bytes = match fs::read(&resolved) {
            Ok(bytes) => bytes,
            Err(error) => return ToolFailure::io("read file", &resolved, &error).into_result(step_id),
        };
        let hash = content_hash(&bytes);

        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(_) => {
                return ToolFailure::new(ErrorKind::Io, "File is not valid UTF-8 text")
                    .into_result(step_id);
            }
        };

        self.snapshots.insert(resolved, hash);
        ToolInvocationResult::success(step_id, truncate_to_byte_limit(content, self.read_max_bytes))
    }

    fn write_file(
        &mut self,
        step_id: StepId,
        path: &str,
        content: &str,
        mode: WriteMode,
    ) -> ToolInvocationResult {
        let resolved = match self.resolve_write_path(path) {
            Ok(path) => path,
            Err(failure) => return failure.into_result(step_id),
        };
        let current = match self.check_write(&resolved, mode) {
            Ok(current) => current,
            Err(failure) => return failure.into_result(step_id),
        };

        let shown = relative_display(&self.workspace_root, &resolved);
        if current.as_deref() == Some(content) {
            return ToolInvocationResult::success(step_id, format!("No changes to {shown}"));
        }

        if let Err(failure) = self.write_atomically(&resolved, content) {
            return failure.into_result(step_id);
        }

        self.snapshots
            .insert(resolved, content_hash(content.as_bytes()));
        tracing::debug!(path = %shown, bytes = content.len(), "wrote file");
        ToolInvocationResult::success(
            step_id,
            format!("Wrote {shown} ({} bytes)", content.len()),
        )
        .with_side_effect(ResourceRef::File { path: shown })
    }

    /// Current text of the write target, after the mode and conflict checks.
    fn check_write(&self, resolved: &Path, mode: WriteMode) -> Result<Option<String>, ToolFailure> {
        let current = match fs::read(resolved) {
            Ok(bytes) => Some(bytes),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => return Err(ToolFailure::io("read file", resolved, &error)),
        };

        if mode == WriteMode::Create && current.is_some() {
            return Err(ToolFailure::new(
                ErrorKind::Conflict,
                format!(
                    "{} already exists; mode=create refuses to replace it",
                    relative_display(&self.workspace_root, resolved)
                ),
            ));
        }

        if let Some(snapshot) = self.snapshots.get(resolved) {
            let now = current
                .as_deref()
                .map(content_hash)
                .unwrap_or_default();
            if &now != snapshot {
                return Err(ToolFailure::new(
                    ErrorKind::Conflict,
                    format!(
                        "{} changed since it was last read",
                        relative_display(&self.workspace_root, resolved)
                    ),
                ));
            }
        }

        match current {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| ToolFailure::new(ErrorKind::Io, "Target file is not valid UTF-8 text")),
        }
    }

    fn write_atomically(&self, resolved: &Path, content: &str) -> Result<(), ToolFailure> {
        let Some(parent) = resolved.parent() else {
            return Err(ToolFailure::new(ErrorKind::InvalidPath, "Path has no parent directory"));
        };
        fs::create_dir_all(parent)
            .map_err(|error| ToolFailure::io("create parent directories", parent, &error))?;

        let canonical_parent = parent
            .canonicalize()
            .map_err(|error| ToolFailure::io("resolve write parent", parent, &error))?;
        self.ensure_inside_workspace(&canonical_parent)?;

        let mut temp = NamedTempFile::new_in(parent)
            .map_err(|error| ToolFailure::io("create temporary file in", parent, &error))?;
        temp.write_all(content.as_bytes())
            .map_err(|error| ToolFailure::io("write", resolved, &error))?;
        if let Ok(metadata) = fs::metadata(resolved) {
            let _ = fs::set_permissions(temp.path(), metadata.permissions());
        }
        temp.persist(resolved)
            .map_err(|error| ToolFailure::io("replace", resolved, &error.error))?;
        Ok(())
    }

    /// Builds a restartable search over `scope`.
    pub fn search(&self, query: &str, scope: &str) -> Result<SearchQuery, ToolFailure> {
        if query.is_empty() {
            return Err(ToolFailure::new(ErrorKind::InvalidParameters, "query must not be empty"));
        }
        let scope = self.resolve_existing_path(scope)?;
        Ok(SearchQuery {
            workspace_root: self.workspace_root.clone(),
            scope,
            query: query.to_string(),
            excluded: self.excluded_dirs.clone(),
        })
    }

    fn search_text(&self, step_id: StepId, query: &str, scope: &str) -> ToolInvocationResult {
        let search = match self.search(query, scope) {
            Ok(search) => search,
            Err(failure) => return failure.into_result(step_id),
        };

        let mut lines = Vec::new();
        let mut matches = search.matches();
        for found in matches.by_ref().take(SEARCH_MATCH_LIMIT) {
            lines.push(format!("{}:{}: {}", found.path, found.line, found.text));
        }

        if lines.is_empty() {
            return ToolInvocationResult::success(step_id, format!("No matches for {query:?}"));
        }
        if matches.next().is_some() {
            lines.push(format!("[truncated after {SEARCH_MATCH_LIMIT} matches]"));
        }
        ToolInvocationResult::success(step_id, lines.join("\n"))
    }

    /// Runs `bash -lc <command>` in the workspace in its own process group.
    ///
    /// The wait is sliced so `cancel` is noticed within one poll interval. On
    /// timeout or cancellation the whole group is killed and the output read
    /// so far is kept.
    #[instrument(skip_all, fields(timeout_sec = timeout.as_secs()))]
    pub fn run_shell(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<ShellOutcome, ToolFailure> {
        let mut builder = Command::new("bash");
        builder
            .arg("-lc")
            .arg(command)
            .current_dir(&self.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            builder.process_group(0);
        }

        let mut child = builder.spawn().map_err(|error| {
            ToolFailure::new(
                ErrorKind::from_io(&error),
                format!("Failed to launch bash command: {error}"),
            )
        })?;
        let pid = child.id();
        let stdout_reader = spawn_pipe_reader(child.stdout.take());
        let stderr_reader = spawn_pipe_reader(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let mut cancelled = false;
        let status = loop {
            if is_cancelled(cancel) {
                cancelled = true;
                break kill_and_reap(&mut child);
            }
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                tracing::warn!(pid, "shell command timed out; killing process group");
                break kill_and_reap(&mut child);
            }

            match child.wait_timeout((deadline - now).min(SHELL_POLL_INTERVAL)) {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(%error, "failed waiting for shell command");
                    break kill_and_reap(&mut child);
                }
            }
        };

        let stdout = join_pipe_reader(stdout_reader);
        let stderr = join_pipe_reader(stderr_reader);

        Ok(ShellOutcome {
            pid: Some(pid),
            exit_code: status.and_then(|status| status.code()),
            timed_out,
            cancelled,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn run_shell_command(
        &self,
        step_id: StepId,
        command: &str,
        timeout_sec: Option<u64>,
        cancel: &CancelSignal,
    ) -> ToolInvocationResult {
        let timeout = timeout_sec
            .map(Duration::from_secs)
            .unwrap_or(self.default_shell_timeout);
        let outcome = match self.run_shell(command, timeout, cancel) {
            Ok(outcome) => outcome,
            Err(failure) => return failure.into_result(step_id),
        };

        let status_label = if outcome.timed_out {
            format!("timeout after {}s", timeout.as_secs())
        } else if outcome.cancelled {
            "cancelled".to_string()
        } else {
            format_exit_code(outcome.exit_code)
        };
        let content = truncate_to_byte_limit(
            format!(
                "status: {status_label}\nstdout:\n{}\nstderr:\n{}",
                outcome.stdout, outcome.stderr
            ),
            self.shell_max_output_bytes,
        );

        let process = ResourceRef::Process {
            command: command.to_string(),
            pid: outcome.pid,
        };
        let result = if outcome.success() {
            ToolInvocationResult::success(step_id, content)
        } else if outcome.timed_out {
            ToolInvocationResult::failure(step_id, ErrorKind::Timeout, content)
        } else if outcome.cancelled {
            ToolInvocationResult::failure(step_id, ErrorKind::Cancelled, content)
        } else {
            ToolInvocationResult::failure(step_id, ErrorKind::NonZeroExit, content)
        };
        result.with_side_effect(process)
    }

    fn resolve_existing_path(&self, path: &str) -> Result<PathBuf, ToolFailure> {
        let candidate = self.contained_candidate(path)?;
        let canonical = candidate
            .canonicalize()
            .map_err(|error| ToolFailure::io("resolve path", &candidate, &error))?;

        self.ensure_inside_workspace(&canonical)?;
        Ok(canonical)
    }

    fn resolve_write_path(&self, path: &str) -> Result<PathBuf, ToolFailure> {
        let candidate = self.contained_candidate(path)?;
        if candidate == self.workspace_root {
            return Err(ToolFailure::new(
                ErrorKind::InvalidPath,
                "Path must name a file inside the workspace",
            ));
        }

        // Symlinks anywhere on the way may still point outside.
        if let Ok(canonical) = candidate.canonicalize() {
            self.ensure_inside_workspace(&canonical)?;
            return Ok(canonical);
        }
        let anchor = canonicalize_existing_ancestor(&candidate)?;
        self.ensure_inside_workspace(&anchor)?;
        Ok(candidate)
    }

    /// Joins `path` onto the root and folds `.`/`..` lexically, rejecting
    /// anything that leaves the root.
    fn contained_candidate(&self, path: &str) -> Result<PathBuf, ToolFailure> {
        if path.trim().is_empty() {
            return Err(ToolFailure::new(ErrorKind::InvalidPath, "Path must not be empty"));
        }

        let raw = Path::new(path);
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.workspace_root.join(raw)
        };

        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(escape_failure(&joined));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }

        self.ensure_inside_workspace(&normalized)?;
        Ok(normalized)
    }

    fn ensure_inside_workspace(&self, path: &Path) -> Result<(), ToolFailure> {
        if path.starts_with(&self.workspace_root) {
            Ok(())
        } else {
            Err(escape_failure(path))
        }
    }
}

impl ToolRunner for ToolRegistry {
    fn invoke(
        &mut self,
        step_id: StepId,
        call: &ToolCall,
        cancel: &CancelSignal,
    ) -> ToolInvocationResult {
        tracing::debug!(step_id, tool = %call.kind(), "dispatching tool");
        match call {
            ToolCall::ReadFile { path } => self.read_file(step_id, path),
            ToolCall::WriteFile {
                path,
                content,
                mode,
            } => self.write_file(step_id, path, content, *mode),
            ToolCall::SearchText { query, scope } => self.search_text(step_id, query, scope),
            ToolCall::RunShellCommand {
                command,
                timeout_sec,
            } => self.run_shell_command(step_id, command, *timeout_sec, cancel),
        }
    }

    fn preview_write(
        &self,
        path: &str,
        content: &str,
        mode: WriteMode,
    ) -> Result<String, ToolFailure> {
        let resolved = self.resolve_write_path(path)?;
        let current = self.check_write(&resolved, mode)?;
        let shown = relative_display(&self.workspace_root, &resolved);
        Ok(diff_engine::preview(&shown, current.as_deref(), content))
    }
}

/// Exit code from the `status:` line written by the shell tool.
#[must_use]
pub fn shell_exit_code(output: &str) -> Option<i32> {
    output
        .lines()
        .next()?
        .strip_prefix("status: exit_code=")?
        .parse()
        .ok()
}

fn escape_failure(path: &Path) -> ToolFailure {
    ToolFailure::new(
        ErrorKind::InvalidPath,
        format!("Path escapes workspace root: {}", path.display()),
    )
}

fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|relative| relative.display().to_string())
        .unwrap_or_else(|_| path.display().to_string())
}

fn spawn_pipe_reader(pipe: Option<impl Read + Send + 'static>) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    thread::Builder::new()
        .name("shell-pipe-reader".to_string())
        .spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            bytes
        })
        .ok()
}

fn join_pipe_reader(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn kill_and_reap(child: &mut Child) -> Option<ExitStatus> {
    kill_process_group(child);
    child.wait().ok()
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: plain syscall on the group this process created with
        // `process_group(0)`; a stale id only yields ESRCH.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

fn truncate_to_byte_limit(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }

    let mut cutoff = max_bytes.min(content.len());
    while cutoff > 0 && !content.is_char_boundary(cutoff) {
        cutoff -= 1;
    }

    let mut truncated = content[..cutoff].to_string();
    truncated.push_str("\n[truncated]");
    truncated
}

fn canonicalize_existing_ancestor(path: &Path) -> Result<PathBuf, ToolFailure> {
    for ancestor in path.ancestors() {
        if ancestor.exists() {
            return ancestor
                .canonicalize()
                .map_err(|error| ToolFailure::io("resolve path", ancestor, &error));
        }
    }

    Err(ToolFailure::new(
        ErrorKind::NotFound,
        format!("No existing ancestor found for path {}", path.display()),
    ))
}

fn format_exit_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit_code={code}"),
        None => "exit_code=terminated_by_signal".to_string(),
    }
}
