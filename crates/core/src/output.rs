// crates/core/src/output.rs
//! Output discovery and temp-file cleanup in a job's temp directory.
//!
//! The executor writes its result as `<tmp_dir>/<tmp_id>.<ext>`, possibly
//! with more dotted parts (`<tmp_id>.f137.mp4.part`). A file belongs to a
//! job only if its name is `tmp_id` itself or continues with a `.`, so
//! `job-1` never claims the files of `job-10`.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::job::{JobType, OutputFile};

/// Extensions of in-flight or scratch files that never count as output.
const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl", "temp", "tmp"];

fn is_partial(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    PARTIAL_EXTENSIONS
        .iter()
        .any(|ext| name.ends_with(&format!(".{ext}")) || name.contains(&format!(".{ext}.")))
}

fn owned_by(name: &str, tmp_id: &str) -> bool {
    name.strip_prefix(tmp_id)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

/// Files in `dir` that belong to `tmp_id`, sorted by name.
async fn owned_files(dir: &Path, tmp_id: &str) -> io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !owned_by(&name.to_string_lossy(), tmp_id) {
            continue;
        }
        if entry.file_type().await?.is_file() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// First finished file for `tmp_id` whose extension the job type accepts.
pub async fn find_output(
    tmp_dir: &Path,
    tmp_id: &str,
    job_type: JobType,
) -> io::Result<Option<OutputFile>> {
    for path in owned_files(tmp_dir, tmp_id).await? {
        if is_partial(&path) {
            continue;
        }
        let accepted = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| job_type.accepts_extension(ext));
        if !accepted {
            continue;
        }
        let size = fs::metadata(&path).await?.len();
        return Ok(Some(OutputFile { path, size }));
    }
    Ok(None)
}

/// Delete every file belonging to `tmp_id`, except `keep`. Returns how many
/// files were removed. A missing directory is not an error.
pub async fn cleanup_temp(tmp_dir: &Path, tmp_id: &str, keep: Option<&Path>) -> io::Result<usize> {
    let mut removed = 0;
    for path in owned_files(tmp_dir, tmp_id).await? {
        if keep.is_some_and(|k| k == path.as_path()) {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Delete one file, ignoring it if it is already gone.
pub async fn remove_output(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str, bytes: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; bytes]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_find_output_matches_prefix_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "other.mp3", 10);
        touch(dir.path(), "abc.webm.part", 10);
        touch(dir.path(), "abc.f137.mp4.part", 10);
        let want = touch(dir.path(), "abc.mp3", 42);

        let found = find_output(dir.path(), "abc", JobType::Audio).await.unwrap().unwrap();
        assert_eq!(found.path, want);
        assert_eq!(found.size, 42);
        assert_eq!(found.file_name(), "abc.mp3");
    }

    #[test]
    fn test_owned_by_requires_dot_after_id() {
        assert!(owned_by("job-1.mp4", "job-1"));
        assert!(owned_by("job-1.f137.mp4.part", "job-1"));
        assert!(owned_by("job-1", "job-1"));
        assert!(!owned_by("job-10.mp4", "job-1"));
        assert!(!owned_by("job-1x.mp4", "job-1"));
        assert!(!owned_by("jo.mp4", "job-1"));
    }

    #[tokio::test]
    async fn test_sibling_ids_do_not_share_files() {
        let dir = tempfile::tempdir().unwrap();
        let ten = touch(dir.path(), "b-10.mp4", 10);
        let ten_part = touch(dir.path(), "b-10.f137.mp4.part", 10);
        touch(dir.path(), "ab.mp4", 10);

        assert!(find_output(dir.path(), "b-1", JobType::Best).await.unwrap().is_none());
        assert!(find_output(dir.path(), "a", JobType::Best).await.unwrap().is_none());
        assert_eq!(cleanup_temp(dir.path(), "b-1", None).await.unwrap(), 0);
        assert_eq!(cleanup_temp(dir.path(), "a", None).await.unwrap(), 0);
        assert!(ten.exists());
        assert!(ten_part.exists());

        let one = touch(dir.path(), "b-1.mp4", 3);
        let found = find_output(dir.path(), "b-1", JobType::Best).await.unwrap().unwrap();
        assert_eq!(found.path, one);
        assert_eq!(cleanup_temp(dir.path(), "b-1", None).await.unwrap(), 1);
        assert!(ten.exists());
    }

    #[tokio::test]
    async fn test_find_output_rejects_wrong_type() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "abc.mp4", 10);
        assert!(find_output(dir.path(), "abc", JobType::Audio).await.unwrap().is_none());
        assert!(find_output(dir.path(), "abc", JobType::Best).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_find_output_uppercase_extension() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "abc.MKV", 1);
        assert!(find_output(dir.path(), "abc", JobType::Clip).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_dir_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert!(find_output(&gone, "abc", JobType::Best).await.unwrap().is_none());
        assert_eq!(cleanup_temp(&gone, "abc", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_temp_keeps_requested_file() {
        let dir = tempfile::tempdir().unwrap();
        let keep = touch(dir.path(), "abc.mp4", 1);
        touch(dir.path(), "abc.webm.part", 1);
        touch(dir.path(), "abc.en.vtt", 1);
        let other = touch(dir.path(), "xyz.mp4", 1);

        let removed = cleanup_temp(dir.path(), "abc", Some(&keep)).await.unwrap();
        assert_eq!(removed, 2);
        assert!(keep.exists());
        assert!(other.exists());

        assert_eq!(cleanup_temp(dir.path(), "abc", None).await.unwrap(), 1);
        assert!(!keep.exists());
    }

    #[tokio::test]
    async fn test_remove_output_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "abc.mp4", 1);
        assert!(remove_output(&path).await.unwrap());
        assert!(!remove_output(&path).await.unwrap());
    }
}
