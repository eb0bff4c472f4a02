use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::types::{LogEntry, LogIndex, Term};

/// Read/append access to the durable log. A single writer (the owning `Node`'s
/// apply loop) ever calls `append`/`truncate_after`; readers may run concurrently.
///
/// Kept behind a trait so tests can swap in an in-memory version.
pub trait LogStorage: Send + Sync {
    fn first_index(&self) -> Option<LogIndex>;
    fn last_index(&self) -> Option<LogIndex>;
    fn term(&self, index: LogIndex) -> Option<Term>;
    fn entry(&self, index: LogIndex) -> Option<LogEntry>;
    /// Appends an entry, truncating any existing entries at or after its index
    /// first (this is how a follower discards a conflicting tail).
    fn append(&self, entry: LogEntry);
    fn truncate_after(&self, index: LogIndex);
    /// Drops all entries at or before `up_to_index`, keeping the base term so
    /// `term(up_to_index)` still resolves; called after a snapshot is durable.
    fn compact(&self, up_to_index: LogIndex, up_to_term: Term);
    /// The (index, term) folded into the most recent snapshot, or (0, 0) if
    /// the log has never been compacted.
    fn snapshot_point(&self) -> (LogIndex, Term);
}

struct Inner {
    /// `entries[i]` is the log entry at index `base_index + 1 + i`.
    entries: Vec<LogEntry>,
    base_index: LogIndex,
    base_term: Term,
}

/// A log that is durable across restarts: every append is serialized as one
/// JSON line appended to a file, and replayed in full on open. Fine for a
/// default snapshot-every-10k-entries policy; a production deployment would
/// follow up with segment rotation.
pub struct FileLog {
    path: PathBuf,
    base_path: PathBuf,
    inner: RwLock<Inner>,
}

impl FileLog {
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("log.jsonl");
        let base_path = dir.join("log.base.json");
        let (base_index, base_term) = std::fs::read(&base_path)
            .ok()
            .and_then(|b| serde_json::from_slice::<(LogIndex, Term)>(&b).ok())
            .unwrap_or((0, 0));
        let mut entries = Vec::new();
        if path.exists() {
            let f = std::fs::File::open(&path)?;
            for line in BufReader::new(f).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = serde_json::from_str(&line)?;
                entries.push(entry);
            }
        }
        Ok(FileLog {
            path,
            base_path,
            inner: RwLock::new(Inner {
                entries,
                base_index,
                base_term,
            }),
        })
    }

    fn save_base(&self, base_index: LogIndex, base_term: Term) {
        if let Ok(bytes) = serde_json::to_vec(&(base_index, base_term)) {
            let _ = warren_core::fs::write_atomic(&self.base_path, &bytes);
        }
    }

    fn rewrite(&self, inner: &Inner) -> std::io::Result<()> {
        let mut buf = Vec::new();
        for e in &inner.entries {
            serde_json::to_writer(&mut buf, e)?;
            buf.push(b'\n');
        }
        warren_core::fs::write_atomic(&self.path, &buf)
    }
}

impl LogStorage for FileLog {
    fn first_index(&self) -> Option<LogIndex> {
        let inner = self.inner.read().unwrap();
        if inner.entries.is_empty() {
            None
        } else {
            Some(inner.base_index + 1)
        }
    }

    fn last_index(&self) -> Option<LogIndex> {
        let inner = self.inner.read().unwrap();
        if inner.entries.is_empty() {
            if inner.base_index == 0 {
                None
            } else {
                Some(inner.base_index)
            }
        } else {
            Some(inner.base_index + inner.entries.len() as u64)
        }
    }

    fn term(&self, index: LogIndex) -> Option<Term> {
        let inner = self.inner.read().unwrap();
        if index == inner.base_index {
            return Some(inner.base_term);
        }
        if index <= inner.base_index {
            return None;
        }
        let offset = (index - inner.base_index - 1) as usize;
        inner.entries.get(offset).map(|e| e.term)
    }

    fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        let inner = self.inner.read().unwrap();
        if index <= inner.base_index {
            return None;
        }
        let offset = (index - inner.base_index - 1) as usize;
        inner.entries.get(offset).cloned()
    }

    fn append(&self, entry: LogEntry) {
        let mut inner = self.inner.write().unwrap();
        let offset = (entry.index - inner.base_index - 1) as usize;
        if offset < inner.entries.len() {
            inner.entries.truncate(offset);
        }
        inner.entries.push(entry);
        let _ = self.rewrite(&inner);
    }

    fn truncate_after(&self, index: LogIndex) {
        let mut inner = self.inner.write().unwrap();
        if index <= inner.base_index {
            inner.entries.clear();
        } else {
            let offset = (index - inner.base_index) as usize;
            inner.entries.truncate(offset);
        }
        let _ = self.rewrite(&inner);
    }

    fn compact(&self, up_to_index: LogIndex, up_to_term: Term) {
        let mut inner = self.inner.write().unwrap();
        if up_to_index <= inner.base_index {
            return;
        }
        let offset = (up_to_index - inner.base_index) as usize;
        if offset <= inner.entries.len() {
            inner.entries.drain(0..offset);
        } else {
            inner.entries.clear();
        }
        inner.base_index = up_to_index;
        inner.base_term = up_to_term;
        let _ = self.rewrite(&inner);
        self.save_base(inner.base_index, inner.base_term);
    }

    fn snapshot_point(&self) -> (LogIndex, Term) {
        let inner = self.inner.read().unwrap();
        (inner.base_index, inner.base_term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogEntryData;

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry {
            index,
            term,
            data: LogEntryData::Noop,
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), None);
        log.append(entry(1, 1));
        log.append(entry(2, 1));
        assert_eq!(log.last_index(), Some(2));
        assert_eq!(log.term(2), Some(1));

        // Reopening replays the file.
        let log2 = FileLog::open(dir.path()).unwrap();
        assert_eq!(log2.last_index(), Some(2));
    }

    #[test]
    fn append_truncates_conflicting_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path()).unwrap();
        log.append(entry(1, 1));
        log.append(entry(2, 1));
        log.append(entry(3, 1));
        // A new leader in term 2 overwrites index 2 onward.
        log.append(entry(2, 2));
        assert_eq!(log.last_index(), Some(2));
        assert_eq!(log.term(2), Some(2));
    }

    #[test]
    fn compact_drops_old_entries_but_keeps_base_term() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path()).unwrap();
        for i in 1..=5u64 {
            log.append(entry(i, 1));
        }
        log.compact(3, 1);
        assert_eq!(log.first_index(), Some(4));
        assert_eq!(log.term(3), Some(1));
        assert_eq!(log.entry(3), None);
        assert_eq!(log.entry(4).unwrap().index, 4);
        assert_eq!(log.snapshot_point(), (3, 1));
    }

    #[test]
    fn compaction_point_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path()).unwrap();
        for i in 1..=5u64 {
            log.append(entry(i, 1));
        }
        log.compact(3, 1);

        let reopened = FileLog::open(dir.path()).unwrap();
        assert_eq!(reopened.snapshot_point(), (3, 1));
        assert_eq!(reopened.term(3), Some(1));
        assert_eq!(reopened.entry(4).unwrap().index, 4);
    }
}
