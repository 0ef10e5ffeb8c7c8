//! # message
//!
//! why: define the two raft rpc procedures and their replies
//! relations: built and consumed by node.rs decisions, carried by raft-node transports
//! what: VoteRequest, VoteReply, AppendEntriesRequest, AppendEntriesReply

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::node::NodeId;

/// RequestVote arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// RequestVote result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// AppendEntries arguments (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    /// Index of the last entry carried, or prev_log_index for a heartbeat
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// AppendEntries result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
}
