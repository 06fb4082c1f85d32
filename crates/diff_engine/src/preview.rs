use similar::TextDiff;

/// Lines of unchanged context around each change.
pub const CONTEXT_LINES: usize = 3;

/// Renders a unified diff turning `old` into `new` for the workspace-relative
/// `path`. Empty when nothing changes.
///
/// `None` for `old` renders a creation (`--- /dev/null`).
#[must_use]
pub fn preview(path: &str, old: Option<&str>, new: &str) -> String {
    let old_text = old.unwrap_or_default();
    if old.is_some() && old_text == new {
        return String::new();
    }

    let old_header = match old {
        Some(_) => format!("a/{path}"),
        None => "/dev/null".to_string(),
    };
    let new_header = format!("b/{path}");

    let diff = TextDiff::from_lines(old_text, new);
    let rendered = diff
        .unified_diff()
        .context_radius(CONTEXT_LINES)
        .header(&old_header, &new_header)
        .to_string();

    if rendered.is_empty() && old.is_none() {
        // Creating an empty file has no hunks to show.
        return format!("{old_header}\n{new_header} (empty file)\n");
    }
    rendered
}

/// Renders the removal of a whole file.
#[must_use]
pub fn preview_delete(path: &str, old: &str) -> String {
    let old_header = format!("a/{path}");
    let diff = TextDiff::from_lines(old, "");
    let rendered = diff
        .unified_diff()
        .context_radius(CONTEXT_LINES)
        .header(&old_header, "/dev/null")
        .to_string();
    rendered
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::preview;

    #[test]
    fn unchanged_content_renders_nothing() {
        assert_eq!(preview("a.txt", Some("same\n"), "same\n"), "");
    }

    #[test]
    fn docstring_insertion_is_the_only_added_line() {
        let diff = preview(
            "m.py",
            Some("def f():\n    return 1\n"),
            "def f():\n    \"\"\"Return one.\"\"\"\n    return 1\n",
        );

        assert!(diff.starts_with("--- a/m.py\n+++ b/m.py\n"));
        let added = diff
            .lines()
            .filter(|line| line.starts_with('+') && !line.starts_with("+++"))
            .collect::<Vec<_>>();
        assert_eq!(added, vec!["+    \"\"\"Return one.\"\"\""]);
        assert!(!diff
            .lines()
            .any(|line| line.starts_with('-') && !line.starts_with("---")));
    }

    #[test]
    fn creation_uses_dev_null_header() {
        let diff = preview("new.txt", None, "hello\n");
        assert!(diff.starts_with("--- /dev/null\n+++ b/new.txt\n"));
        assert!(diff.contains("+hello"));
    }
}
