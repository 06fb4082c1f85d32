//! Unified-diff preview and apply.
//!
//! [`preview`] renders the change a write would make; [`apply`] takes a unified
//! diff (as produced by [`preview`], `git diff` or `diff -u`) and applies it
//! under a root directory. Hunks are matched positionally and exactly: context
//! that no longer matches is a [`DiffError::HunkMismatch`], never a fuzzy
//! apply, so applying the same diff twice fails the second time.

mod apply;
mod error;
mod parser;
mod preview;

use std::io::Write;
use std::path::Path;

pub use apply::{apply, apply_parsed, apply_to_text, check, resolve_in_root, ApplyOutcome, FileTouched};
pub use error::DiffError;
pub use parser::{parse_patch, FileChangeKind, FilePatch, Hunk, HunkLine, Patch};
pub use preview::{preview, preview_delete, CONTEXT_LINES};

/// Applies `diff_text` under `root` and prints one `A|M|D path` line per file.
pub fn apply_patch(
    diff_text: &str,
    root: &Path,
    stdout: &mut impl Write,
) -> anyhow::Result<ApplyOutcome> {
    let outcome = apply(diff_text, root)?;
    writeln!(stdout, "Success. Updated the following files:")?;
    for file in &outcome.files_touched {
        writeln!(stdout, "{} {}", file.change.as_str(), file.path)?;
    }
    Ok(outcome)
}
