//! Exclusive run lock on the state directory.
//!
//! Every mutating command holds this for its whole duration. The lock is
//! advisory (`flock` / `LockFileEx` via `fs4`) and released when the
//! [`RunLock`] is dropped or the process dies.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use tracing::debug;

use crate::error::Error;

pub const LOCK_FILE: &str = "sync2rag.lock";

pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock or fail immediately with [`Error::Locked`].
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir).with_context(|| {
            format!("Failed to create state directory: {}", state_dir.display())
        })?;
        let path = state_dir.join(LOCK_FILE);
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(true) => {}
            Ok(false) => return Err(Error::Locked(path.display().to_string()).into()),
            Err(e) => {
                return Err(Error::Locked(format!("{}: {}", path.display(), e)).into());
            }
        }

        let mut handle = &file;
        let _ = handle.set_len(0);
        let _ = writeln!(handle, "pid={}", std::process::id());
        debug!(path = %path.display(), "run lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
