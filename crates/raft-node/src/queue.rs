//! # queue
//!
//! why: hand client commands to the leader's replication cycle
//! relations: drained by replication.rs, filled through RaftHandle::submit or directly by an embedding program
//! what: QueuedCommand, CommandSource trait, MemoryQueue

use parking_lot::Mutex;
use raft_core::Command;
use std::collections::VecDeque;

/// A command waiting to become a log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub command: Command,
    pub correlation_id: Option<String>,
}

impl QueuedCommand {
    pub fn new(command: Command) -> Self {
        Self { command, correlation_id: None }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Source of pending commands. Each drained command becomes exactly one log entry.
pub trait CommandSource: Send + Sync {
    /// Take every pending command, oldest first
    fn drain(&self) -> Vec<QueuedCommand>;

    /// Put commands that could not be appended back at the front, order preserved
    fn requeue(&self, commands: Vec<QueuedCommand>);

    /// Add one command at the back
    fn enqueue(&self, command: QueuedCommand);
}

/// In-process fifo queue
#[derive(Debug, Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<QueuedCommand>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: Command) {
        self.enqueue(QueuedCommand::new(command));
    }

    /// Enqueue with a client correlation id for later status lookups
    pub fn push_tracked(&self, command: Command, correlation_id: impl Into<String>) {
        self.enqueue(QueuedCommand::new(command).with_correlation_id(correlation_id));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl CommandSource for MemoryQueue {
    fn drain(&self) -> Vec<QueuedCommand> {
        self.pending.lock().drain(..).collect()
    }

    fn requeue(&self, commands: Vec<QueuedCommand>) {
        let mut pending = self.pending.lock();
        for command in commands.into_iter().rev() {
            pending.push_front(command);
        }
    }

    fn enqueue(&self, command: QueuedCommand) {
        self.pending.lock().push_back(command);
    }
}
