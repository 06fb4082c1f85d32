use assert_matches::assert_matches;
use diff_engine::{apply, apply_patch, check, preview, preview_delete, DiffError, FileChangeKind};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn seed(root: &std::path::Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, content).expect("seed file");
}

fn read(root: &std::path::Path, relative: &str) -> String {
    std::fs::read_to_string(root.join(relative)).expect("read file")
}

#[test]
fn preview_then_apply_reproduces_new_content_byte_for_byte() {
    let cases = [
        ("a\nb\nc\n", "a\nB\nc\nd\n"),
        ("no newline", "no newline\nnow has one\n"),
        ("ends\n", "ends without"),
        ("", "fresh\ncontent\n"),
        (
            "1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n11\n12\n",
            "1\ntwo\n3\n4\n5\n6\n7\n8\n9\n10\neleven\n12\n",
        ),
        ("crlf\r\nlines\r\n", "crlf\r\nLINES\r\n"),
    ];

    for (old, new) in cases {
        let dir = tempdir().expect("tempdir");
        seed(dir.path(), "f.txt", old);

        let diff = preview("f.txt", Some(old), new);
        let outcome = apply(&diff, dir.path()).expect("preview applies to its own input");

        assert_eq!(read(dir.path(), "f.txt"), new, "diff was:\n{diff}");
        assert_eq!(outcome.files_touched.len(), 1);
        assert_eq!(outcome.files_touched[0].change, FileChangeKind::Modify);
    }
}

#[test]
fn applying_the_same_diff_twice_is_a_hunk_mismatch() {
    let dir = tempdir().expect("tempdir");
    let old = "def f():\n    return 1\n";
    let new = "def f():\n    \"\"\"Return one.\"\"\"\n    return 1\n";
    seed(dir.path(), "m.py", old);
    let diff = preview("m.py", Some(old), new);

    apply(&diff, dir.path()).expect("first apply");
    let error = apply(&diff, dir.path()).expect_err("second apply must fail");

    assert_matches!(error, DiffError::HunkMismatch { ref path, .. } if path == "m.py");
    assert_eq!(read(dir.path(), "m.py"), new);
}

#[test]
fn diff_repeating_its_context_cannot_be_applied_twice() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path(), "f.txt", "a\n");
    let diff = preview("f.txt", Some("a\n"), "a\na\n");

    apply(&diff, dir.path()).expect("first apply");
    let error = apply(&diff, dir.path()).expect_err("second apply must fail");

    assert_matches!(error, DiffError::HunkMismatch { ref path, .. } if path == "f.txt");
    assert_eq!(read(dir.path(), "f.txt"), "a\na\n");
}

#[test]
fn creation_diff_cannot_be_applied_twice() {
    let dir = tempdir().expect("tempdir");
    let diff = preview("nested/new.txt", None, "hello\n");

    let outcome = apply(&diff, dir.path()).expect("creates file");
    assert_eq!(outcome.files_touched[0].change, FileChangeKind::Add);
    assert_eq!(read(dir.path(), "nested/new.txt"), "hello\n");

    assert_matches!(
        apply(&diff, dir.path()),
        Err(DiffError::HunkMismatch { .. })
    );
}

#[test]
fn delete_diff_removes_the_file() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path(), "gone.txt", "bye\n");
    let diff = preview_delete("gone.txt", "bye\n");

    let outcome = apply(&diff, dir.path()).expect("deletes");

    assert_eq!(outcome.files_touched[0].change, FileChangeKind::Delete);
    assert!(!dir.path().join("gone.txt").exists());
}

#[test]
fn mismatch_in_any_file_leaves_every_file_untouched() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path(), "one.txt", "one\n");
    seed(dir.path(), "two.txt", "two\n");

    let diff = concat!(
        "--- a/one.txt\n+++ b/one.txt\n@@ -1 +1 @@\n-one\n+ONE\n",
        "--- a/two.txt\n+++ b/two.txt\n@@ -1 +1 @@\n-stale\n+TWO\n",
    );

    let error = apply(diff, dir.path()).expect_err("second file mismatches");

    assert_matches!(error, DiffError::HunkMismatch { ref path, hunk: 1, line: 1 } if path == "two.txt");
    assert_eq!(read(dir.path(), "one.txt"), "one\n");
    assert_eq!(read(dir.path(), "two.txt"), "two\n");
}

#[test]
fn check_validates_without_writing() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path(), "x.txt", "x\n");
    let diff = preview("x.txt", Some("x\n"), "y\n");

    let outcome = check(&diff, dir.path()).expect("diff applies");

    assert_eq!(outcome.files_touched[0].path, "x.txt");
    assert_eq!(read(dir.path(), "x.txt"), "x\n");
}

#[test]
fn paths_outside_root_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let diff = "--- a/../escape.txt\n+++ b/../escape.txt\n@@ -1 +1 @@\n-a\n+b\n";

    assert_matches!(
        apply(diff, dir.path()),
        Err(DiffError::InvalidPath { .. })
    );
}

#[test]
fn malformed_diff_is_reported_before_touching_files() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path(), "x.txt", "x\n");

    let error = apply("--- a/x.txt\n+++ b/x.txt\n@@ -1 +1 @@\n", dir.path())
        .expect_err("hunk body is missing");

    assert_matches!(error, DiffError::MalformedDiff { .. });
    assert_eq!(read(dir.path(), "x.txt"), "x\n");
}

#[test]
fn apply_patch_reports_touched_files() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path(), "update.txt", "old\n");
    seed(dir.path(), "delete.txt", "gone\n");

    let diff = concat!(
        "diff --git a/add.txt b/add.txt\nnew file mode 100644\n",
        "--- /dev/null\n+++ b/add.txt\n@@ -0,0 +1 @@\n+new\n",
        "--- a/delete.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-gone\n",
        "--- a/update.txt\n+++ b/update.txt\n@@ -1 +1 @@\n-old\n+newer\n",
    );

    let mut stdout = Vec::new();
    apply_patch(diff, dir.path(), &mut stdout).expect("apply");

    assert_eq!(
        String::from_utf8(stdout).expect("utf8"),
        "Success. Updated the following files:\nA add.txt\nD delete.txt\nM update.txt\n"
    );
    assert_eq!(read(dir.path(), "add.txt"), "new\n");
    assert_eq!(read(dir.path(), "update.txt"), "newer\n");
    assert!(!dir.path().join("delete.txt").exists());
}
