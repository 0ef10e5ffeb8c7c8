//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via raft-storage
//! what: LogEntry struct, apply status, last-log bookkeeping helpers

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandKind};

/// Outcome of applying an entry to the domain state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Appended but not yet applied on this node
    #[default]
    Pending,
    /// Applied and the domain accepted the command
    Succeeded,
    /// Applied but the domain rejected the command
    Failed,
}

impl EntryStatus {
    pub fn is_applied(&self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The index of this entry in the log (1-indexed, contiguous)
    pub index: u64,
    /// The term when this entry was created
    pub term: u64,
    /// The command to be applied to the state machine
    pub command: Command,
    /// Local apply status, not part of the replicated identity of the entry
    #[serde(default)]
    pub status: EntryStatus,
    /// Client supplied id used to look the entry up after it is applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl LogEntry {
    /// Create a new pending log entry
    pub fn new(term: u64, index: u64, command: Command) -> Self {
        Self {
            index,
            term,
            command,
            status: EntryStatus::Pending,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }

    /// Copy of this entry as a follower stores it: same identity, not yet applied locally
    pub fn as_pending(&self) -> Self {
        Self {
            status: EntryStatus::Pending,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_is_pending() {
        let entry = LogEntry::new(1, 1, Command::App(b"x".to_vec()));
        assert_eq!(entry.status, EntryStatus::Pending);
        assert!(!entry.status.is_applied());
        assert_eq!(entry.kind(), CommandKind::App);
    }

    #[test]
    fn as_pending_keeps_identity() {
        let mut entry = LogEntry::new(3, 9, Command::App(vec![1])).with_correlation_id("req-1");
        entry.status = EntryStatus::Failed;

        let copy = entry.as_pending();
        assert_eq!(copy.index, 9);
        assert_eq!(copy.term, 3);
        assert_eq!(copy.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(copy.status, EntryStatus::Pending);
    }

    #[test]
    fn status_defaults_when_missing_from_json() {
        let json = r#"{"index":1,"term":1,"command":{"kind":"app","payload":[1,2]}}"#;
        let entry: LogEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.correlation_id, None);
    }
}
