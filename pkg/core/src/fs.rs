//! Small filesystem helpers shared by the KV store and the raft log: every
//! durable write in this workspace goes through a temp-file-then-rename so a
//! crash mid-write never leaves a half-written file where a reader expects one.

use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Writes `contents` to `path` atomically: writes to `path.tmp`, `fsync`s it,
/// then renames over `path`. On platforms with POSIX rename semantics the
/// rename is atomic, so a reader of `path` never observes a partial write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        // Best-effort: fsync the directory entry too, so the rename itself
        // survives a crash. Not fatal if this fails (e.g. on platforms where
        // directories can't be opened for reading).
        if let Ok(dir_file) = File::open(dir) {
            let _ = dir_file.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        write_atomic(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!path.with_extension("tmp").exists());
    }
}
