//! Durable append-only Raft log.
//!
//! The log owns a single file of checksummed entry lines (see
//! [`crate::entry`]) plus the commit index. All operations run inside
//! the server's critical section, so appends and commit advancement
//! stay serialized with the decisions that produced them.
//!
//! Durability rules:
//! - every appended entry is written and fsynced before the call
//!   returns;
//! - truncation of an uncommitted tail shrinks the file to the byte
//!   offset recorded for the first dropped entry;
//! - loading re-validates every checksum and the index/term ordering
//!   invariants, and any failure is fatal — a corrupt log is a
//!   startup error, never silently repaired.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::entry::LogEntry;
use crate::error::{RaftError, Result};
use crate::types::{LogIndex, Term};

/// Append-only ordered sequence of entries with a commit index and a
/// durable backing file.
#[derive(Debug)]
pub struct Log {
    file: File,
    path: PathBuf,
    entries: Vec<LogEntry>,
    /// Byte offset of each entry's line in the file, parallel to
    /// `entries`. Lets truncation shrink the file in place.
    offsets: Vec<u64>,
    /// End-of-file offset (where the next line will land).
    size: u64,
    commit_index: LogIndex,
}

impl Log {
    /// Open the log at `path`, creating it if absent.
    ///
    /// Existing entries are validated (checksum, contiguous indexes
    /// from 1, non-decreasing terms) and replayed through `apply` in
    /// order; the commit index is restored to the last durably
    /// written index.
    pub fn open(path: impl Into<PathBuf>, mut apply: impl FnMut(&LogEntry)) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let data = std::fs::read_to_string(&path)?;
        let mut entries: Vec<LogEntry> = Vec::new();
        let mut offsets = Vec::new();
        let mut offset = 0u64;

        for (lineno, line) in data.split_inclusive('\n').enumerate() {
            let lineno = lineno + 1;
            if !line.ends_with('\n') {
                return Err(RaftError::Corrupt {
                    line: lineno,
                    reason: "truncated final line".to_string(),
                });
            }
            let entry = LogEntry::decode(line).map_err(|e| RaftError::Corrupt {
                line: lineno,
                reason: e.to_string(),
            })?;

            let (last_index, last_term) = last_info_of(&entries);
            if entry.index != last_index.next() {
                return Err(RaftError::Corrupt {
                    line: lineno,
                    reason: format!(
                        "index {} does not follow {} contiguously",
                        entry.index, last_index
                    ),
                });
            }
            if entry.term < last_term {
                return Err(RaftError::Corrupt {
                    line: lineno,
                    reason: format!("term {} decreases from {}", entry.term, last_term),
                });
            }

            apply(&entry);
            offsets.push(offset);
            offset += line.len() as u64;
            entries.push(entry);
        }

        let commit_index = entries.last().map(|e| e.index).unwrap_or(LogIndex::ZERO);
        tracing::debug!(
            path = %path.display(),
            entries = entries.len(),
            commit = %commit_index,
            "log opened"
        );

        Ok(Self {
            file,
            path,
            entries,
            offsets,
            size: offset,
            commit_index,
        })
    }

    /// `(index, term)` of the last entry, or zeros for an empty log.
    pub fn last_info(&self) -> (LogIndex, Term) {
        last_info_of(&self.entries)
    }

    /// Index of the last entry, or zero for an empty log.
    pub fn last_index(&self) -> LogIndex {
        self.last_info().0
    }

    /// `(index, term)` at the commit point, or zeros when nothing is
    /// committed.
    pub fn commit_info(&self) -> (LogIndex, Term) {
        let term = self
            .entry_at(self.commit_index)
            .map(|e| e.term)
            .unwrap_or(Term::ZERO);
        (self.commit_index, term)
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Term of the entry at `index`; `Some(0)` for index zero, `None`
    /// past the end.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == LogIndex::ZERO {
            return Some(Term::ZERO);
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == LogIndex::ZERO {
            return None;
        }
        self.entries.get(index.as_u64() as usize - 1)
    }

    /// Clones of every entry strictly after `index`, in order. Used to
    /// build replication batches.
    pub fn entries_after(&self, index: LogIndex) -> Vec<LogEntry> {
        let from = index.as_u64() as usize;
        if from >= self.entries.len() {
            return Vec::new();
        }
        self.entries[from..].to_vec()
    }

    /// Append a single entry, persisting it before returning.
    ///
    /// Requires `entry.index == last_index + 1` and
    /// `entry.term >= last_term`.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let (last_index, last_term) = self.last_info();
        if entry.index != last_index.next() || entry.term < last_term {
            return Err(RaftError::EntryOutOfOrder {
                last_index,
                last_term,
                index: entry.index,
                term: entry.term,
            });
        }

        let line = entry.encode()?;
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;

        self.offsets.push(self.size);
        self.size += line.len() as u64;
        self.entries.push(entry);
        Ok(())
    }

    /// Append a batch anchored at `(prev_index, prev_term)`.
    ///
    /// The anchor must match an existing entry (or be zero for a
    /// prepend into an empty position); any uncommitted tail strictly
    /// after the anchor is discarded first. Discarding a committed
    /// entry is refused.
    pub fn append_batch_after(
        &mut self,
        prev_index: LogIndex,
        prev_term: Term,
        entries: Vec<LogEntry>,
    ) -> Result<()> {
        self.truncate_after(prev_index, prev_term)?;
        for entry in entries {
            self.append(entry)?;
        }
        Ok(())
    }

    /// Drop all entries strictly after `index`, verifying that the
    /// entry at `index` carries `term`.
    fn truncate_after(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if index < self.commit_index {
            return Err(RaftError::CommittedTruncate {
                index,
                commit: self.commit_index,
            });
        }

        if index > LogIndex::ZERO {
            match self.entry_at(index) {
                Some(entry) if entry.term == term => {}
                _ => return Err(RaftError::AnchorMismatch { index, term }),
            }
        }

        let keep = index.as_u64() as usize;
        if keep < self.entries.len() {
            let cut = self.offsets[keep];
            tracing::debug!(
                after = %index,
                dropped = self.entries.len() - keep,
                "truncating uncommitted tail"
            );
            self.entries.truncate(keep);
            self.offsets.truncate(keep);
            self.file.set_len(cut)?;
            self.file.sync_data()?;
            self.size = cut;
        }
        Ok(())
    }

    /// Advance the commit index to `min(index, last_index)`, invoking
    /// `apply` on each newly committed entry in index order before
    /// returning. Never regresses.
    pub fn commit_to(&mut self, index: LogIndex, mut apply: impl FnMut(&LogEntry)) {
        let target = index.min(self.last_index());
        while self.commit_index < target {
            self.commit_index = self.commit_index.next();
            if let Some(entry) = self.entry_at(self.commit_index) {
                apply(entry);
            }
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

fn last_info_of(entries: &[LogEntry]) -> (LogIndex, Term) {
    entries
        .last()
        .map(|e| (e.index, e.term))
        .unwrap_or((LogIndex::ZERO, Term::ZERO))
}
