use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SessionStoreError;
use crate::paths::{session_file_name, session_id_from_file_name, session_root};
use crate::replay::Session;
use crate::schema::{JsonLine, SessionEntry, SessionEntryKind, SessionHeader, SESSION_VERSION};

/// Which session [`SessionStore::load`] resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSelector {
    Latest,
    /// Full id, or a prefix matching exactly one session.
    Id(String),
}

impl FromStr for SessionSelector {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        Ok(if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("latest") {
            Self::Latest
        } else {
            Self::Id(trimmed.to_string())
        })
    }
}

/// Listing row for one session file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: String,
    pub cwd: String,
    pub path: PathBuf,
    pub task_count: usize,
    pub entry_count: u64,
    pub last_task: Option<String>,
}

/// Append-only JSONL session log plus the state replayed from it.
///
/// Every append is a single `write_all` of one newline-terminated line
/// followed by `sync_data`, so a crash leaves a valid prefix. A trailing line
/// without its newline is treated as torn: it is dropped on open and the file
/// is truncated back to the last complete entry.
pub struct SessionStore {
    pub(crate) path: PathBuf,
    pub(crate) file: File,
    pub(crate) header: SessionHeader,
    pub(crate) session: Session,
    poisoned: bool,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("path", &self.path)
            .field("session_id", &self.header.session_id)
            .field("last_seq", &self.session.last_seq)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Creates a session under `<cwd>/.agent/sessions`.
    pub fn create_new(cwd: &Path) -> Result<Self, SessionStoreError> {
        Self::create_in(&session_root(cwd), cwd)
    }

    /// Creates a session file under `root` recording `cwd` in its header.
    pub fn create_in(root: &Path, cwd: &Path) -> Result<Self, SessionStoreError> {
        if !cwd.is_absolute() {
            return Err(SessionStoreError::NonAbsoluteCreateCwd {
                path: cwd.to_path_buf(),
            });
        }

        fs::create_dir_all(root)
            .map_err(|source| SessionStoreError::io("creating session directory", root, source))?;

        let session_id = Uuid::new_v4().to_string();
        let created_at = now_rfc3339()?;
        let header = SessionHeader::v1(&session_id, &created_at, cwd.display().to_string());
        let path = root.join(session_file_name(&created_at, &session_id));

        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|source| SessionStoreError::io("creating session file", &path, source))?;

        let mut line = serde_json::to_string(&header)
            .map_err(|source| SessionStoreError::json_serialize(&path, source))?;
        line.push('\n');
        write_line(&mut file, &path, &line)?;

        tracing::info!(session_id = %session_id, path = %path.display(), "created session");

        Ok(Self {
            session: Session::from_header(&header),
            path,
            file,
            header,
            poisoned: false,
        })
    }

    /// Opens and replays an existing session file.
    pub fn open(path: &Path) -> Result<Self, SessionStoreError> {
        let path = path.to_path_buf();
        let bytes = fs::read(&path)
            .map_err(|source| SessionStoreError::io("opening session file", &path, source))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| SessionStoreError::InvalidUtf8 { path: path.clone() })?;

        let (header, session, valid_len) = replay_text(&path, &text)?;

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|source| {
                SessionStoreError::io("opening session file for append", &path, source)
            })?;

        if valid_len < text.len() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = text.len() - valid_len,
                "dropping torn final line of session log"
            );
            file.set_len(valid_len as u64)
                .map_err(|source| SessionStoreError::io("truncating torn session tail", &path, source))?;
        }

        Ok(Self {
            path,
            file,
            header,
            session,
            poisoned: false,
        })
    }

    /// Opens the session chosen by `selector` under `root`.
    pub fn load(root: &Path, selector: &SessionSelector) -> Result<Self, SessionStoreError> {
        let candidates = session_files(root)?;

        let path = match selector {
            SessionSelector::Latest => latest_session_file(root, candidates)?,
            SessionSelector::Id(id) => session_file_for_id(root, candidates, id)?,
        };

        let store = Self::open(&path)?;
        tracing::info!(
            session_id = %store.header.session_id,
            entries = store.session.last_seq,
            "resumed session"
        );
        Ok(store)
    }

    /// Summaries of every readable session under `root`, newest first.
    /// Unreadable files are skipped with a warning.
    pub fn list(root: &Path) -> Result<Vec<SessionSummary>, SessionStoreError> {
        let mut summaries = Vec::new();
        for path in session_files(root)? {
            match Self::open_read_only(&path) {
                Ok((header, session)) => summaries.push(SessionSummary {
                    id: header.session_id,
                    created_at: header.created_at,
                    cwd: header.cwd,
                    path,
                    task_count: session.task_history.len(),
                    entry_count: session.last_seq,
                    last_task: session.latest_task().map(|task| task.text.clone()),
                }),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping unreadable session file");
                }
            }
        }

        summaries.sort_by(|left, right| {
            created_at_key(&right.created_at)
                .cmp(&created_at_key(&left.created_at))
                .then_with(|| right.path.cmp(&left.path))
        });
        Ok(summaries)
    }

    /// Appends one entry, assigning the next `seq` and the current timestamp.
    /// Returns the assigned `seq`.
    ///
    /// The entry is checked against the replayed state before anything is
    /// written. A failed write poisons the store; the caller must treat it as
    /// fatal.
    pub fn append(&mut self, kind: SessionEntryKind) -> Result<u64, SessionStoreError> {
        if self.poisoned {
            return Err(SessionStoreError::Poisoned {
                path: self.path.clone(),
            });
        }

        let entry = SessionEntry::new(self.session.last_seq + 1, now_rfc3339()?, kind);
        let settled = self.session.prepare(&entry).map_err(|violation| {
            SessionStoreError::replay(&self.path, self.next_line_number(), violation)
        })?;

        let mut line = serde_json::to_string(&entry)
            .map_err(|source| SessionStoreError::json_serialize(&self.path, source))?;
        line.push('\n');

        if let Err(error) = write_line(&mut self.file, &self.path, &line) {
            self.poisoned = true;
            return Err(error);
        }

        tracing::debug!(seq = entry.seq, kind = entry.kind.as_str(), "appended session entry");
        self.session.commit(&entry, settled);
        Ok(entry.seq)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.header.session_id
    }

    /// Replayed state as of the last successful append.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Owned copy for readers that outlive the borrow.
    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.session.clone()
    }

    fn next_line_number(&self) -> usize {
        usize::try_from(self.session.last_seq)
            .unwrap_or(usize::MAX)
            .saturating_add(2)
    }

    fn open_read_only(path: &Path) -> Result<(SessionHeader, Session), SessionStoreError> {
        let bytes = fs::read(path)
            .map_err(|source| SessionStoreError::io("reading session file", path, source))?;
        let text = String::from_utf8(bytes).map_err(|_| SessionStoreError::InvalidUtf8 {
            path: path.to_path_buf(),
        })?;
        let (header, session, _) = replay_text(path, &text)?;
        Ok((header, session))
    }
}

/// Replays a whole log. Returns the header, the rebuilt session and the byte
/// length of the committed prefix.
fn replay_text(
    path: &Path,
    text: &str,
) -> Result<(SessionHeader, Session, usize), SessionStoreError> {
    let mut header: Option<SessionHeader> = None;
    let mut session: Option<Session> = None;
    let mut valid_len = 0;

    for (line_index, raw_line) in text.split_inclusive('\n').enumerate() {
        let line_number = line_index + 1;
        let Some(line) = raw_line.strip_suffix('\n') else {
            // Torn tail: the newline is written with the record, so a line
            // without one never finished appending.
            break;
        };
        let line = line.strip_suffix('\r').unwrap_or(line);

        let parsed = JsonLine::parse(line)
            .map_err(|source| SessionStoreError::json_line(path, line_number, source))?;

        match parsed {
            JsonLine::Session(parsed_header) => {
                if line_number != 1 {
                    return Err(SessionStoreError::InvalidEntryRecord {
                        path: path.to_path_buf(),
                        line: line_number,
                    });
                }
                validate_header_line(path, line_number, &parsed_header)?;
                session = Some(Session::from_header(&parsed_header));
                header = Some(parsed_header);
            }
            JsonLine::Entry(entry) => {
                let Some(session) = session.as_mut() else {
                    return Err(SessionStoreError::InvalidHeaderRecord {
                        path: path.to_path_buf(),
                        line: line_number,
                    });
                };
                validate_rfc3339(path, line_number, "ts", &entry.ts)?;
                session
                    .apply(&entry)
                    .map_err(|violation| SessionStoreError::replay(path, line_number, violation))?;
            }
        }

        valid_len += raw_line.len();
    }

    match (header, session) {
        (Some(header), Some(session)) => Ok((header, session, valid_len)),
        _ => Err(SessionStoreError::MissingHeader {
            path: path.to_path_buf(),
        }),
    }
}

fn write_line(file: &mut File, path: &Path, line: &str) -> Result<(), SessionStoreError> {
    file.write_all(line.as_bytes())
        .map_err(|source| SessionStoreError::io("appending session line", path, source))?;
    file.flush()
        .map_err(|source| SessionStoreError::io("flushing session file", path, source))?;
    file.sync_data()
        .map_err(|source| SessionStoreError::io("syncing session file", path, source))
}

fn session_files(root: &Path) -> Result<Vec<PathBuf>, SessionStoreError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(SessionStoreError::io("listing session directory", root, source));
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|source| SessionStoreError::io("listing session directory", root, source))?;
        let path = entry.path();
        if path.is_file() && session_id_from_file_name(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn latest_session_file(root: &Path, candidates: Vec<PathBuf>) -> Result<PathBuf, SessionStoreError> {
    candidates
        .into_iter()
        .filter_map(|path| match read_header(&path) {
            Ok(header) => Some((created_at_key(&header.created_at), path)),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "ignoring unreadable session file");
                None
            }
        })
        .max()
        .map(|(_, path)| path)
        .ok_or_else(|| SessionStoreError::NoSessionsFound {
            root: root.to_path_buf(),
        })
}

fn session_file_for_id(
    root: &Path,
    candidates: Vec<PathBuf>,
    id: &str,
) -> Result<PathBuf, SessionStoreError> {
    let mut matches: Vec<(String, PathBuf)> = candidates
        .into_iter()
        .filter_map(|path| {
            let file_id = session_id_from_file_name(&path)?.to_string();
            file_id.starts_with(id).then_some((file_id, path))
        })
        .collect();

    if let Some(position) = matches.iter().position(|(file_id, _)| file_id == id) {
        return Ok(matches.swap_remove(position).1);
    }

    match matches.len() {
        0 => Err(SessionStoreError::UnknownSession {
            root: root.to_path_buf(),
            id: id.to_string(),
        }),
        1 => Ok(matches.remove(0).1),
        _ => Err(SessionStoreError::AmbiguousSession {
            root: root.to_path_buf(),
            id: id.to_string(),
            candidates: matches.into_iter().map(|(file_id, _)| file_id).collect(),
        }),
    }
}

fn read_header(path: &Path) -> Result<SessionHeader, SessionStoreError> {
    let text = fs::read_to_string(path)
        .map_err(|source| SessionStoreError::io("reading session header", path, source))?;
    let first = text
        .split_inclusive('\n')
        .next()
        .and_then(|line| line.strip_suffix('\n'))
        .ok_or_else(|| SessionStoreError::MissingHeader {
            path: path.to_path_buf(),
        })?;

    match JsonLine::parse(first).map_err(|source| SessionStoreError::json_line(path, 1, source))? {
        JsonLine::Session(header) => {
            validate_header_line(path, 1, &header)?;
            Ok(header)
        }
        JsonLine::Entry(_) => Err(SessionStoreError::InvalidHeaderRecord {
            path: path.to_path_buf(),
            line: 1,
        }),
    }
}

/// Sort key for `created_at`; unparsable values sort oldest.
fn created_at_key(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

fn now_rfc3339() -> Result<String, SessionStoreError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(SessionStoreError::ClockFormat)
}

pub(crate) fn validate_header_line(
    path: &Path,
    line_number: usize,
    header: &SessionHeader,
) -> Result<(), SessionStoreError> {
    if header.version != SESSION_VERSION {
        return Err(SessionStoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            line: line_number,
            found: header.version,
        });
    }

    validate_rfc3339(path, line_number, "created_at", &header.created_at)?;

    if !Path::new(&header.cwd).is_absolute() {
        return Err(SessionStoreError::NonAbsoluteCwd {
            path: path.to_path_buf(),
            line: line_number,
            cwd: header.cwd.clone(),
        });
    }

    Ok(())
}

pub(crate) fn validate_rfc3339(
    path: &Path,
    line_number: usize,
    field: &'static str,
    value: &str,
) -> Result<(), SessionStoreError> {
    if OffsetDateTime::parse(value, &Rfc3339).is_err() {
        return Err(SessionStoreError::InvalidTimestamp {
            path: path.to_path_buf(),
            line: line_number,
            field,
            value: value.to_string(),
        });
    }

    Ok(())
}
