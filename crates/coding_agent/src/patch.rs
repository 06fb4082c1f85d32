//! `nv patch`: check or apply a user-supplied unified diff.

use std::io::{self, Write};
use std::path::Path;

use agent_provider::CancelSignal;
use diff_engine::{apply_parsed, check, parse_patch, ApplyOutcome, DiffError, Patch};
use thiserror::Error;

use crate::safety::{ConfirmationRequest, Confirmer, SafetyGate};

#[derive(Debug, Error)]
pub enum PatchCommandError {
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error("patch contains no file changes")]
    Empty,
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchApplied {
    Applied(ApplyOutcome),
    Rejected,
}

/// Prints one `A|M|D path (+added -removed)` line per file, then checks that
/// every hunk applies under `root` without writing anything.
pub fn preview_patch(
    diff_text: &str,
    root: &Path,
    out: &mut dyn Write,
) -> Result<ApplyOutcome, PatchCommandError> {
    let patch = parsed(diff_text)?;
    write_file_summary(&patch, out)?;

    let outcome = check(diff_text, root)?;
    writeln!(out, "Patch applies cleanly under {}.", root.display())?;
    Ok(outcome)
}

/// Shows the diff, asks the gate, then applies it. Nothing is written when a
/// hunk does not match or the user declines.
pub fn apply_patch_file(
    diff_text: &str,
    root: &Path,
    gate: &mut SafetyGate,
    confirmer: &mut dyn Confirmer,
    cancel: &CancelSignal,
    out: &mut dyn Write,
) -> Result<PatchApplied, PatchCommandError> {
    let patch = parsed(diff_text)?;
    check(diff_text, root)?;

    if gate.approves_all() {
        write!(out, "{diff_text}")?;
    }
    let request = ConfirmationRequest::Patch {
        diff: diff_text.to_string(),
    };
    if !gate.ask(&request, confirmer, cancel).is_approved() {
        writeln!(out, "Patch rejected; nothing was changed.")?;
        return Ok(PatchApplied::Rejected);
    }

    let outcome = apply_parsed(&patch, root)?;
    writeln!(out, "Updated the following files:")?;
    for file in &outcome.files_touched {
        writeln!(out, "{} {}", file.change.as_str(), file.path)?;
    }
    Ok(PatchApplied::Applied(outcome))
}

fn parsed(diff_text: &str) -> Result<Patch, PatchCommandError> {
    if diff_text.trim().is_empty() {
        return Err(PatchCommandError::Empty);
    }
    Ok(parse_patch(diff_text)?)
}

fn write_file_summary(patch: &Patch, out: &mut dyn Write) -> io::Result<()> {
    for file in &patch.files {
        writeln!(
            out,
            "{} {} (+{} -{})",
            file.kind().as_str(),
            file.path(),
            file.added_lines(),
            file.removed_lines()
        )?;
    }
    Ok(())
}
