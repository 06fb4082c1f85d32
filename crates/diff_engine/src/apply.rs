use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::DiffError;
use crate::parser::{parse_patch, FileChangeKind, FilePatch, Hunk, Patch};

/// One file changed by an apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTouched {
    pub path: String,
    pub change: FileChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    pub files_touched: Vec<FileTouched>,
}

/// Result of applying one file's hunks in memory.
#[derive(Debug)]
struct PlannedWrite {
    target: PathBuf,
    touched: FileTouched,
    /// `None` deletes the file.
    content: Option<String>,
}

/// Applies `diff_text` under `target_root`.
///
/// Every hunk of every file is matched before anything is written; a single
/// mismatch leaves the tree untouched. Each file is then replaced atomically
/// through a temporary file in the same directory.
pub fn apply(diff_text: &str, target_root: &Path) -> Result<ApplyOutcome, DiffError> {
    let patch = parse_patch(diff_text)?;
    apply_parsed(&patch, target_root)
}

/// Same as [`apply`] without writing anything.
pub fn check(diff_text: &str, target_root: &Path) -> Result<ApplyOutcome, DiffError> {
    let patch = parse_patch(diff_text)?;
    let planned = plan_writes(&patch, target_root)?;
    Ok(outcome(&planned))
}

pub fn apply_parsed(patch: &Patch, target_root: &Path) -> Result<ApplyOutcome, DiffError> {
    let planned = plan_writes(patch, target_root)?;
    for write in &planned {
        commit(write)?;
    }

    let outcome = outcome(&planned);
    tracing::info!(files = outcome.files_touched.len(), "applied patch");
    Ok(outcome)
}

/// Applies one file's hunks to `old` (`None` when the file is absent).
/// Returns the new content, or `None` when the patch deletes the file.
pub fn apply_to_text(file: &FilePatch, old: Option<&str>) -> Result<Option<String>, DiffError> {
    let path = file.path();
    match (file.kind(), old) {
        (FileChangeKind::Add, Some(_)) => {
            return Err(DiffError::HunkMismatch {
                path: path.to_string(),
                hunk: 1,
                line: 0,
            });
        }
        (FileChangeKind::Modify | FileChangeKind::Delete, None) => {
            return Err(DiffError::HunkMismatch {
                path: path.to_string(),
                hunk: 1,
                line: 0,
            });
        }
        _ => {}
    }

    let old = old.unwrap_or_default();
    let old_lines = old.split_inclusive('\n').collect::<Vec<_>>();
    let mut out = String::with_capacity(old.len());
    let mut cursor = 0;

    for (index, hunk) in file.hunks.iter().enumerate() {
        let hunk_number = index + 1;
        let mismatch = |line: usize| DiffError::HunkMismatch {
            path: path.to_string(),
            hunk: hunk_number,
            line,
        };

        let start = hunk_position(hunk);
        if start < cursor || start > old_lines.len() {
            return Err(mismatch(start + 1));
        }

        let expected = hunk.old_side();
        if expected.is_empty() && start == 0 && !old_lines.is_empty() {
            // A context-free insertion at the top only applies to an empty
            // file; anything else is a re-application or a stale diff.
            return Err(mismatch(1));
        }
        for (offset, want) in expected.iter().enumerate() {
            let line_index = start + offset;
            if old_lines.get(line_index) != Some(want) {
                return Err(mismatch(line_index + 1));
            }
        }

        let replacement = hunk.new_side();
        if replacement.len() > expected.len()
            && lines_match_at(&old_lines, new_side_position(hunk), &replacement)
        {
            // The grown side is already in place: the diff was applied before.
            return Err(mismatch(new_side_position(hunk) + 1));
        }

        out.extend(old_lines[cursor..start].iter().copied());
        out.extend(replacement);
        cursor = start + expected.len();
    }
    out.extend(old_lines[cursor..].iter().copied());

    if file.kind() == FileChangeKind::Delete {
        if !out.is_empty() {
            return Err(DiffError::HunkMismatch {
                path: path.to_string(),
                hunk: file.hunks.len(),
                line: old_lines.len(),
            });
        }
        return Ok(None);
    }
    Ok(Some(out))
}

/// Zero-based index of the first old line the hunk covers. A hunk with no
/// old lines inserts after line `old_start`.
fn hunk_position(hunk: &Hunk) -> usize {
    if hunk.old_len == 0 {
        hunk.old_start
    } else {
        hunk.old_start.saturating_sub(1)
    }
}

/// Zero-based index where the hunk's new side sits once it is applied.
fn new_side_position(hunk: &Hunk) -> usize {
    if hunk.new_len == 0 {
        hunk.new_start
    } else {
        hunk.new_start.saturating_sub(1)
    }
}

fn lines_match_at(lines: &[&str], start: usize, want: &[&str]) -> bool {
    lines
        .get(start..start + want.len())
        .is_some_and(|window| window == want)
}

fn plan_writes(patch: &Patch, root: &Path) -> Result<Vec<PlannedWrite>, DiffError> {
    let mut planned = Vec::with_capacity(patch.files.len());
    for file in &patch.files {
        let relative = file.path();
        let target = resolve_in_root(root, relative)?;
        if planned
            .iter()
            .any(|write: &PlannedWrite| write.target == target)
        {
            return Err(DiffError::malformed(
                0,
                format!("{relative} appears more than once"),
            ));
        }

        let old = match fs::read_to_string(&target) {
            Ok(text) => Some(text),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(DiffError::io("reading patch target", &target, source)),
        };

        let content = apply_to_text(file, old.as_deref())?;
        planned.push(PlannedWrite {
            target,
            touched: FileTouched {
                path: relative.to_string(),
                change: file.kind(),
            },
            content,
        });
    }
    Ok(planned)
}

fn commit(write: &PlannedWrite) -> Result<(), DiffError> {
    let target = &write.target;
    let Some(content) = &write.content else {
        return fs::remove_file(target)
            .map_err(|source| DiffError::io("deleting file", target, source));
    };

    let parent = target.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|source| DiffError::io("creating parent directory", parent, source))?;

    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|source| DiffError::io("creating temporary file", parent, source))?;
    temp.write_all(content.as_bytes())
        .map_err(|source| DiffError::io("writing temporary file", temp.path(), source))?;
    temp.as_file()
        .sync_all()
        .map_err(|source| DiffError::io("syncing temporary file", target, source))?;
    if let Ok(metadata) = fs::metadata(target) {
        let _ = fs::set_permissions(temp.path(), metadata.permissions());
    }
    temp.persist(target)
        .map_err(|error| DiffError::io("replacing file", target, error.error))?;
    Ok(())
}

fn outcome(planned: &[PlannedWrite]) -> ApplyOutcome {
    ApplyOutcome {
        files_touched: planned.iter().map(|write| write.touched.clone()).collect(),
    }
}

/// Joins a diff path onto `root`, refusing absolute paths and `..`.
pub fn resolve_in_root(root: &Path, relative: &str) -> Result<PathBuf, DiffError> {
    let candidate = Path::new(relative);
    if relative.is_empty() {
        return Err(DiffError::InvalidPath {
            path: relative.to_string(),
            reason: "empty path",
        });
    }

    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(DiffError::InvalidPath {
                    path: relative.to_string(),
                    reason: "parent directory components are not allowed",
                });
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(DiffError::InvalidPath {
                    path: relative.to_string(),
                    reason: "absolute paths are not allowed",
                });
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parser::parse_patch;

    fn single_file(diff: &str) -> FilePatch {
        parse_patch(diff)
            .expect("diff parses")
            .files
            .remove(0)
    }

    #[test]
    fn applies_middle_hunk_keeping_surrounding_lines() {
        let file = single_file("--- a/x\n+++ b/x\n@@ -2,3 +2,3 @@\n b\n-c\n+C\n d\n");

        let new = apply_to_text(&file, Some("a\nb\nc\nd\ne\n")).expect("applies");

        assert_eq!(new.as_deref(), Some("a\nb\nC\nd\ne\n"));
    }

    #[test]
    fn context_mismatch_reports_line() {
        let file = single_file("--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n a\n-b\n+B\n");

        let error = apply_to_text(&file, Some("a\nz\n")).expect_err("mismatch");

        assert_matches!(error, DiffError::HunkMismatch { hunk: 1, line: 2, .. });
    }

    #[test]
    fn missing_trailing_newline_must_match_exactly() {
        let file = single_file(
            "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+b\n",
        );

        assert_eq!(
            apply_to_text(&file, Some("a")).expect("applies").as_deref(),
            Some("b\n")
        );
        assert_matches!(
            apply_to_text(&file, Some("a\n")),
            Err(DiffError::HunkMismatch { .. })
        );
    }

    #[test]
    fn already_applied_growth_is_a_mismatch() {
        let file = single_file("--- a/x\n+++ b/x\n@@ -1 +1,2 @@\n a\n+a\n");

        assert_eq!(
            apply_to_text(&file, Some("a\n")).expect("applies").as_deref(),
            Some("a\na\n")
        );
        assert_matches!(
            apply_to_text(&file, Some("a\na\n")),
            Err(DiffError::HunkMismatch { hunk: 1, line: 1, .. })
        );
    }

    #[test]
    fn shrinking_hunk_is_not_mistaken_for_applied() {
        let file = single_file("--- a/x\n+++ b/x\n@@ -1,2 +1 @@\n a\n-b\n");

        assert_eq!(
            apply_to_text(&file, Some("a\nb\n")).expect("applies").as_deref(),
            Some("a\n")
        );
    }

    #[test]
    fn add_requires_absent_target_and_delete_requires_present() {
        let add = single_file("--- /dev/null\n+++ b/n\n@@ -0,0 +1 @@\n+n\n");
        assert_eq!(
            apply_to_text(&add, None).expect("creates").as_deref(),
            Some("n\n")
        );
        assert_matches!(
            apply_to_text(&add, Some("n\n")),
            Err(DiffError::HunkMismatch { .. })
        );

        let delete = single_file("--- a/n\n+++ /dev/null\n@@ -1 +0,0 @@\n-n\n");
        assert_eq!(apply_to_text(&delete, Some("n\n")).expect("deletes"), None);
        assert_matches!(
            apply_to_text(&delete, None),
            Err(DiffError::HunkMismatch { .. })
        );
    }

    #[test]
    fn resolve_rejects_escapes() {
        let root = Path::new("/work");
        assert_eq!(
            resolve_in_root(root, "./src/m.py").expect("inside"),
            PathBuf::from("/work/src/m.py")
        );
        assert_matches!(
            resolve_in_root(root, "../etc/passwd"),
            Err(DiffError::InvalidPath { .. })
        );
        assert_matches!(
            resolve_in_root(root, "/etc/passwd"),
            Err(DiffError::InvalidPath { .. })
        );
    }
}
