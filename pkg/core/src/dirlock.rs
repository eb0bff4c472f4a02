use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

#[derive(thiserror::Error, Debug)]
pub enum DirLockError {
    #[error("data directory {0:?} is already locked by another process")]
    AlreadyLocked(PathBuf),
    #[error("io error locking data directory: {0}")]
    Io(#[from] std::io::Error),
}

/// An exclusive, advisory lock on a node's data directory.
///
/// Held for the lifetime of a node process so that two instances can never be
/// started against the same directory at once.
pub struct DirLock {
    path: PathBuf,
    file: File,
}

impl DirLock {
    /// Opens (creating if needed) `dir` and takes an exclusive lock on a sentinel
    /// file inside it. Fails immediately rather than blocking if another process
    /// already holds the lock.
    pub fn open(dir: &Path) -> Result<Self, DirLockError> {
        std::fs::create_dir_all(dir)?;
        let lock_path = dir.join("LOCK");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;

        file.try_lock_exclusive()
            .map_err(|_| DirLockError::AlreadyLocked(dir.to_owned()))?;

        Ok(DirLock {
            path: dir.to_owned(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let first = DirLock::open(dir.path()).unwrap();
        let second = DirLock::open(dir.path());
        assert!(second.is_err());
        drop(first);
        // Once released, a new lock should succeed.
        let third = DirLock::open(dir.path());
        assert!(third.is_ok());
    }
}
