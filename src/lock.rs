//! Advisory locks on the data root.
//!
//! - <root>/LOCK: held for a whole switch, never waited on
//! - <root>/index.lock: held around each store update, waited on
//!
//! Both are released on drop.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, Result};

const LOCK_FILE: &str = "LOCK";
pub const STORE_LOCK_FILE: &str = "index.lock";

pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open_lock_file(root: &Path, name: &str) -> std::io::Result<(File, PathBuf)> {
    std::fs::create_dir_all(root)?;
    let path = root.join(name);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)?;
    Ok((file, path))
}

/// Take the exclusive switch lock without waiting. A lock held elsewhere is
/// reported as `OperationInProgress`.
pub fn try_acquire(root: &Path) -> Result<LockGuard> {
    let (file, path) = open_lock_file(root, LOCK_FILE)?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(LockGuard { file, path }),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(Error::OperationInProgress),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Take an exclusive lock on `<root>/<name>`, waiting for other holders.
/// Each call opens its own handle, so two guards in one process exclude each
/// other too.
pub fn acquire(root: &Path, name: &str) -> Result<LockGuard> {
    let (file, path) = open_lock_file(root, name)?;
    file.lock_exclusive()?;
    Ok(LockGuard { file, path })
}
