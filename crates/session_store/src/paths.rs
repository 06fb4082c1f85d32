use std::path::{Path, PathBuf};

pub const SESSION_DIR: [&str; 2] = [".agent", "sessions"];
pub const SESSION_FILE_EXTENSION: &str = "jsonl";

#[must_use]
pub fn session_root(cwd: &Path) -> PathBuf {
    cwd.join(SESSION_DIR[0]).join(SESSION_DIR[1])
}

#[must_use]
pub fn sanitize_timestamp_for_filename(timestamp: &str) -> String {
    timestamp
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' | ' ' => '-',
            _ => c,
        })
        .collect()
}

#[must_use]
pub fn session_file_name(created_at: &str, session_id: &str) -> String {
    format!(
        "{}_{}.{SESSION_FILE_EXTENSION}",
        sanitize_timestamp_for_filename(created_at),
        session_id
    )
}

/// Session id embedded in a file name produced by [`session_file_name`].
#[must_use]
pub fn session_id_from_file_name(path: &Path) -> Option<&str> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(SESSION_FILE_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (_, id) = stem.rsplit_once('_')?;
    (!id.is_empty()).then_some(id)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{session_file_name, session_id_from_file_name};

    #[test]
    fn file_name_round_trips_session_id() {
        let name = session_file_name("2026-02-14T00:00:00Z", "abc-123");
        assert_eq!(name, "2026-02-14T00-00-00Z_abc-123.jsonl");
        assert_eq!(session_id_from_file_name(Path::new(&name)), Some("abc-123"));
        assert_eq!(session_id_from_file_name(Path::new("notes.txt")), None);
    }
}
