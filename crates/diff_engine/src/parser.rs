use crate::error::DiffError;

const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

/// One line of a hunk. The text keeps its line terminator unless the diff
/// marked it with `\ No newline at end of file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Removed(String),
    Added(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Lines the target must contain at the hunk position.
    #[must_use]
    pub fn old_side(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Removed(text) => Some(text.as_str()),
                HunkLine::Added(_) => None,
            })
            .collect()
    }

    /// Lines that replace [`Hunk::old_side`].
    #[must_use]
    pub fn new_side(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Added(text) => Some(text.as_str()),
                HunkLine::Removed(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Add,
    Modify,
    Delete,
}

impl FileChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "A",
            Self::Modify => "M",
            Self::Delete => "D",
        }
    }
}

/// All hunks for one file. `None` on either side stands for `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    #[must_use]
    pub fn kind(&self) -> FileChangeKind {
        match (&self.old_path, &self.new_path) {
            (None, _) => FileChangeKind::Add,
            (_, None) => FileChangeKind::Delete,
            _ => FileChangeKind::Modify,
        }
    }

    /// Workspace-relative path this patch touches.
    #[must_use]
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn added_lines(&self) -> usize {
        self.count(|line| matches!(line, HunkLine::Added(_)))
    }

    #[must_use]
    pub fn removed_lines(&self) -> usize {
        self.count(|line| matches!(line, HunkLine::Removed(_)))
    }

    fn count(&self, predicate: impl Fn(&HunkLine) -> bool) -> usize {
        self.hunks
            .iter()
            .flat_map(|hunk| hunk.lines.iter())
            .filter(|line| predicate(line))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Patch {
    pub files: Vec<FilePatch>,
}

/// Parses a unified diff. Text before the first `---` header of each file
/// (`diff --git`, `index`, commit messages) is ignored.
pub fn parse_patch(text: &str) -> Result<Patch, DiffError> {
    let lines = text.split_inclusive('\n').collect::<Vec<_>>();
    let mut files = Vec::new();
    let mut index = 0;

    while index < lines.len() {
        if !trim_eol(lines[index]).starts_with("--- ") {
            index += 1;
            continue;
        }

        let old_path = parse_file_header(lines[index], "--- ", index + 1)?;
        let Some(next) = lines.get(index + 1) else {
            return Err(DiffError::malformed(index + 2, "missing '+++' header"));
        };
        if !trim_eol(next).starts_with("+++ ") {
            return Err(DiffError::malformed(index + 2, "expected '+++' header"));
        }
        let new_path = parse_file_header(next, "+++ ", index + 2)?;
        if old_path.is_none() && new_path.is_none() {
            return Err(DiffError::malformed(index + 1, "both sides are /dev/null"));
        }
        if let (Some(old), Some(new)) = (&old_path, &new_path) {
            if old != new {
                return Err(DiffError::malformed(
                    index + 1,
                    format!("renames are not supported ({old} -> {new})"),
                ));
            }
        }
        index += 2;

        let mut hunks = Vec::new();
        while let Some(line) = lines.get(index) {
            if !trim_eol(line).starts_with("@@") {
                break;
            }
            let (hunk, consumed) = parse_hunk(&lines, index)?;
            hunks.push(hunk);
            index += consumed;
        }

        if hunks.is_empty() {
            return Err(DiffError::malformed(index + 1, "file header without hunks"));
        }
        files.push(FilePatch {
            old_path,
            new_path,
            hunks,
        });
    }

    if files.is_empty() {
        return Err(DiffError::malformed(1, "no file headers found"));
    }

    Ok(Patch { files })
}

fn parse_file_header(
    line: &str,
    prefix: &str,
    line_number: usize,
) -> Result<Option<String>, DiffError> {
    let raw = trim_eol(line)
        .strip_prefix(prefix)
        .unwrap_or_default();
    // `diff -u` appends a tab-separated timestamp.
    let raw = raw.split('\t').next().unwrap_or_default().trim();
    if raw.is_empty() {
        return Err(DiffError::malformed(line_number, "empty file path"));
    }
    if raw == "/dev/null" {
        return Ok(None);
    }

    let path = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Ok(Some(path.to_string()))
}

/// Parses the hunk starting at `start`; returns it and the number of lines
/// consumed, header included.
fn parse_hunk(lines: &[&str], start: usize) -> Result<(Hunk, usize), DiffError> {
    let header_line = start + 1;
    let (old_start, old_len, new_start, new_len) = parse_hunk_header(lines[start], header_line)?;

    let mut hunk_lines: Vec<HunkLine> = Vec::new();
    let mut old_seen = 0;
    let mut new_seen = 0;
    let mut index = start + 1;

    while old_seen < old_len || new_seen < new_len {
        let Some(raw) = lines.get(index) else {
            return Err(DiffError::malformed(
                index + 1,
                format!("hunk ends early: expected -{old_len} +{new_len} lines"),
            ));
        };

        let line = if raw.ends_with('\n') {
            (*raw).to_string()
        } else {
            format!("{raw}\n")
        };
        let parsed = match line.chars().next() {
            Some(' ') => HunkLine::Context(line[1..].to_string()),
            Some('-') => HunkLine::Removed(line[1..].to_string()),
            Some('+') => HunkLine::Added(line[1..].to_string()),
            // Editors strip the single space of an empty context line.
            Some('\n') => HunkLine::Context("\n".to_string()),
            Some('\r') if line == "\r\n" => HunkLine::Context("\r\n".to_string()),
            Some('\\') => {
                mark_no_newline(&mut hunk_lines, index + 1)?;
                index += 1;
                continue;
            }
            _ => {
                return Err(DiffError::malformed(
                    index + 1,
                    "unexpected line inside hunk",
                ))
            }
        };

        match parsed {
            HunkLine::Context(_) => {
                old_seen += 1;
                new_seen += 1;
            }
            HunkLine::Removed(_) => old_seen += 1,
            HunkLine::Added(_) => new_seen += 1,
        }
        if old_seen > old_len || new_seen > new_len {
            return Err(DiffError::malformed(
                index + 1,
                "hunk has more lines than its header declares",
            ));
        }
        hunk_lines.push(parsed);
        index += 1;
    }

    if let Some(raw) = lines.get(index) {
        if trim_eol(raw).starts_with(NO_NEWLINE_MARKER) {
            mark_no_newline(&mut hunk_lines, index + 1)?;
            index += 1;
        }
    }

    Ok((
        Hunk {
            old_start,
            old_len,
            new_start,
            new_len,
            lines: hunk_lines,
        },
        index - start,
    ))
}

fn mark_no_newline(lines: &mut [HunkLine], line_number: usize) -> Result<(), DiffError> {
    let Some(last) = lines.last_mut() else {
        return Err(DiffError::malformed(
            line_number,
            "no-newline marker without a preceding line",
        ));
    };
    let text = match last {
        HunkLine::Context(text) | HunkLine::Removed(text) | HunkLine::Added(text) => text,
    };
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(())
}

fn parse_hunk_header(
    line: &str,
    line_number: usize,
) -> Result<(usize, usize, usize, usize), DiffError> {
    let malformed = || DiffError::malformed(line_number, "invalid hunk header");
    let body = trim_eol(line)
        .strip_prefix("@@ ")
        .and_then(|rest| rest.split_once(" @@"))
        .map(|(ranges, _)| ranges)
        .ok_or_else(malformed)?;

    let mut parts = body.split_whitespace();
    let old = parts
        .next()
        .and_then(|part| part.strip_prefix('-'))
        .ok_or_else(malformed)?;
    let new = parts
        .next()
        .and_then(|part| part.strip_prefix('+'))
        .ok_or_else(malformed)?;
    if parts.next().is_some() {
        return Err(malformed());
    }

    let (old_start, old_len) = parse_range(old).ok_or_else(malformed)?;
    let (new_start, new_len) = parse_range(new).ok_or_else(malformed)?;
    Ok((old_start, old_len, new_start, new_len))
}

/// `start[,len]`; a missing length means one line.
fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

fn trim_eol(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_git_headers_and_ranges() {
        let patch = parse_patch(
            "diff --git a/src/m.py b/src/m.py\nindex 1..2 100644\n--- a/src/m.py\n+++ b/src/m.py\n@@ -1 +1,2 @@\n def f():\n+    \"\"\"Doc.\"\"\"\n",
        )
        .expect("patch parses");

        assert_eq!(patch.files.len(), 1);
        let file = &patch.files[0];
        assert_eq!(file.path(), "src/m.py");
        assert_eq!(file.kind(), FileChangeKind::Modify);
        assert_eq!(
            (file.hunks[0].old_start, file.hunks[0].old_len),
            (1, 1)
        );
        assert_eq!(file.added_lines(), 1);
        assert_eq!(file.removed_lines(), 0);
    }

    #[test]
    fn dev_null_marks_add_and_delete() {
        let patch = parse_patch(
            "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1 @@\n+hi\n--- a/old.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-bye\n",
        )
        .expect("patch parses");

        assert_eq!(patch.files[0].kind(), FileChangeKind::Add);
        assert_eq!(patch.files[0].path(), "new.txt");
        assert_eq!(patch.files[1].kind(), FileChangeKind::Delete);
        assert_eq!(patch.files[1].path(), "old.txt");
    }

    #[test]
    fn no_newline_marker_strips_terminator_of_previous_line() {
        let patch = parse_patch(
            "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-old\n\\ No newline at end of file\n+new\n\\ No newline at end of file\n",
        )
        .expect("patch parses");

        let hunk = &patch.files[0].hunks[0];
        assert_eq!(hunk.old_side(), vec!["old"]);
        assert_eq!(hunk.new_side(), vec!["new"]);
    }

    #[test]
    fn timestamps_after_tab_are_ignored() {
        let patch = parse_patch(
            "--- a/x\t2026-01-01 00:00:00\n+++ b/x\t2026-01-02 00:00:00\n@@ -1 +1 @@\n-a\n+b\n",
        )
        .expect("patch parses");
        assert_eq!(patch.files[0].path(), "x");
    }

    #[test]
    fn short_hunk_is_malformed() {
        let error = parse_patch("--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n a\n")
            .expect_err("hunk is truncated");
        assert_matches!(error, DiffError::MalformedDiff { line: 5, .. });
    }

    #[test]
    fn garbage_inside_hunk_is_malformed() {
        let error = parse_patch("--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n a\n?b\n")
            .expect_err("bad prefix");
        assert_matches!(error, DiffError::MalformedDiff { line: 5, .. });
    }

    #[test]
    fn bad_header_and_empty_input_are_malformed() {
        assert_matches!(
            parse_patch("--- a/x\n+++ b/x\n@@ -x +1 @@\n+a\n"),
            Err(DiffError::MalformedDiff { line: 3, .. })
        );
        assert_matches!(
            parse_patch("just some text\n"),
            Err(DiffError::MalformedDiff { line: 1, .. })
        );
        assert_matches!(
            parse_patch("--- a/x\n+++ b/y\n@@ -1 +1 @@\n-a\n+b\n"),
            Err(DiffError::MalformedDiff { line: 1, .. })
        );
    }
}
