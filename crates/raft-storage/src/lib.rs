//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: stores raft-core log entries and hard state, owned by the raft-node event loop
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::InMemoryStorage;

use raft_core::{EntryStatus, HardState, LogEntry, NodeId};
use std::io;
use thiserror::Error;

/// failure of a durable write or read. the operation that hit it must not
/// proceed as if the write had happened.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io failed: {0}")]
    Io(#[from] io::Error),
    #[error("could not encode or decode persisted state: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("log must stay contiguous: expected index {expected}, got {got}")]
    NonContiguous { expected: u64, got: u64 },
    #[error("no log entry at index {0}")]
    MissingEntry(u64),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// trait for durable storage of raft state
///
/// the log is 1-indexed and contiguous: the entry at index `i` lives at
/// position `i - 1`. every write must be durable before it returns `Ok`.
///
/// this abstraction allows the same engine to work with:
/// - real filesystem (native)
/// - in-memory (testing)
pub trait Storage: Send {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) -> StorageResult<()>;

    /// load the persisted term and voted_for, `(0, None)` for a new node
    fn load_term_and_vote(&self) -> StorageResult<(u64, Option<NodeId>)>;

    /// append entries to the end of the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()>;

    /// load all log entries (for crash recovery and inspection)
    fn load_log(&self) -> StorageResult<Vec<LogEntry>>;

    /// entry at `index`, `None` past the end or for index 0
    fn entry(&self, index: u64) -> StorageResult<Option<LogEntry>>;

    /// number of entries, equal to the last index
    fn log_len(&self) -> StorageResult<u64>;

    /// entries with index >= `start`, in order
    fn entries_from(&self, start: u64) -> StorageResult<Vec<LogEntry>>;

    /// truncate log from given index (for conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> StorageResult<()>;

    /// record the apply outcome of an entry in place
    fn set_status(&mut self, index: u64, status: EntryStatus) -> StorageResult<()>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> StorageResult<()>;

    // -- derived lookups --

    fn save_hard_state(&mut self, hard_state: &HardState) -> StorageResult<()> {
        self.save_term_and_vote(hard_state.term, hard_state.voted_for.clone())
    }

    fn load_hard_state(&self) -> StorageResult<HardState> {
        let (term, voted_for) = self.load_term_and_vote()?;
        Ok(HardState { term, voted_for })
    }

    /// term of the entry at `index`; index 0 is the empty baseline with term 0
    fn term_at(&self, index: u64) -> StorageResult<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        Ok(self.entry(index)?.map(|e| e.term))
    }

    /// `(last_index, last_term)`, `(0, 0)` when empty
    fn last_log_info(&self) -> StorageResult<(u64, u64)> {
        let len = self.log_len()?;
        let term = self.term_at(len)?.unwrap_or(0);
        Ok((len, term))
    }

    /// entries in `(after, up_to]`, in order
    fn entries_between(&self, after: u64, up_to: u64) -> StorageResult<Vec<LogEntry>> {
        let mut entries = self.entries_from(after + 1)?;
        entries.retain(|e| e.index <= up_to);
        Ok(entries)
    }

    /// most recent entry carrying `correlation_id`
    fn find_by_correlation(&self, correlation_id: &str) -> StorageResult<Option<LogEntry>> {
        Ok(self
            .load_log()?
            .into_iter()
            .rev()
            .find(|e| e.correlation_id.as_deref() == Some(correlation_id)))
    }
}

/// check that `entries` continue a log currently `len` entries long
pub(crate) fn check_contiguous(len: u64, entries: &[LogEntry]) -> StorageResult<()> {
    for (offset, entry) in entries.iter().enumerate() {
        let expected = len + 1 + offset as u64;
        if entry.index != expected {
            return Err(StorageError::NonContiguous { expected, got: entry.index });
        }
    }
    Ok(())
}

/// position of `index` in a contiguous 1-based log held as a slice
pub(crate) fn slot(log: &[LogEntry], index: u64) -> Option<usize> {
    if index == 0 || index > log.len() as u64 {
        None
    } else {
        Some((index - 1) as usize)
    }
}
