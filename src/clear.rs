//! Filesystem side of `sync2rag clear`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Remove every child of `dir` except those in `keep`. The directory itself
/// stays. Returns the removed paths; failures are logged and skipped.
pub fn clear_dir(dir: &Path, keep: &[PathBuf]) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %dir.display(), "directory not found; nothing to clear");
            return removed;
        }
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "failed to read directory");
            return removed;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if keep.iter().any(|k| k == &path) {
            continue;
        }
        let result = match entry.file_type() {
            Ok(ft) if ft.is_dir() => fs::remove_dir_all(&path),
            _ => fs::remove_file(&path),
        };
        match result {
            Ok(()) => removed.push(path),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove"),
        }
    }
    removed.sort();
    removed
}

/// Remove a single file if present.
pub fn remove_file(path: &Path) -> Option<PathBuf> {
    match fs::remove_file(path) {
        Ok(()) => Some(path.to_path_buf()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn clears_children_but_keeps_listed_paths() {
        let tmp = TempDir::new().unwrap();
        let keep = tmp.path().join("sync2rag.lock");
        std::fs::write(&keep, "").unwrap();
        std::fs::write(tmp.path().join("scan_index.json"), "{}").unwrap();
        std::fs::create_dir_all(tmp.path().join("nested/deeper")).unwrap();

        let removed = clear_dir(tmp.path(), &[keep.clone()]);
        assert_eq!(removed.len(), 2);
        assert!(keep.exists());
        assert!(tmp.path().exists());
        assert!(!tmp.path().join("nested").exists());
    }

    #[test]
    fn missing_directory_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(clear_dir(&tmp.path().join("nope"), &[]).is_empty());
        assert!(remove_file(&tmp.path().join("nope.json")).is_none());
    }
}
