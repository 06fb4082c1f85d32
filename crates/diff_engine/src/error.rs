use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("malformed diff at line {line}: {reason}")]
    MalformedDiff { line: usize, reason: String },

    #[error("hunk {hunk} does not apply to {path} (first mismatch at line {line})")]
    HunkMismatch {
        path: String,
        hunk: usize,
        line: usize,
    },

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DiffError {
    #[must_use]
    pub fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedDiff {
            line,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}
