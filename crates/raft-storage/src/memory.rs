//! in-memory storage implementation

use raft_core::{EntryStatus, LogEntry, NodeId};

use crate::{check_contiguous, slot, Storage, StorageError, StorageResult};

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    term: u64,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// seed a storage with prior state, as if loaded after a restart
    pub fn with_state(term: u64, voted_for: Option<NodeId>, log: Vec<LogEntry>) -> StorageResult<Self> {
        check_contiguous(0, &log)?;
        Ok(Self { term, voted_for, log })
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) -> StorageResult<()> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> StorageResult<(u64, Option<NodeId>)> {
        Ok((self.term, self.voted_for.clone()))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        check_contiguous(self.log.len() as u64, entries)?;
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> StorageResult<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn entry(&self, index: u64) -> StorageResult<Option<LogEntry>> {
        Ok(slot(&self.log, index).map(|i| self.log[i].clone()))
    }

    fn log_len(&self) -> StorageResult<u64> {
        Ok(self.log.len() as u64)
    }

    fn entries_from(&self, start: u64) -> StorageResult<Vec<LogEntry>> {
        let from = start.max(1) as usize - 1;
        Ok(self.log.get(from..).map(<[LogEntry]>::to_vec).unwrap_or_default())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> StorageResult<()> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn set_status(&mut self, index: u64, status: EntryStatus) -> StorageResult<()> {
        let i = slot(&self.log, index).ok_or(StorageError::MissingEntry(index))?;
        self.log[i].status = status;
        Ok(())
    }

    fn clear(&mut self) -> StorageResult<()> {
        self.term = 0;
        self.voted_for = None;
        self.log.clear();
        Ok(())
    }
}
