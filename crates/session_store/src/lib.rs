//! Append-only JSONL transcript of tasks, plans, step outcomes and chat turns.
//!
//! One file per session under `<cwd>/.agent/sessions`. The first line is a
//! [`SessionHeader`]; every following line is a [`SessionEntry`] with a dense
//! `seq`. Loading a session replays the log into a [`Session`].

mod error;
mod paths;
mod replay;
mod schema;
mod store;

pub use error::SessionStoreError;
pub use paths::{session_file_name, session_id_from_file_name, session_root};
pub use replay::{ReplayViolation, Session};
pub use schema::{
    EntryRecordType, SessionEntry, SessionEntryKind, SessionHeader, SessionRecordType,
};
pub use store::{SessionSelector, SessionStore, SessionSummary};
