//! # raft-core
//!
//! why: implement the pure, i/o-free half of the consensus engine
//! relations: used by raft-storage for the persisted entry shape, by raft-node for role transitions
//! what: node ids, commands, log entries, rpc messages, role state machine, quorum and commit arithmetic

pub mod command;
pub mod config;
pub mod log;
pub mod message;
pub mod node;

pub use command::{AdminCommand, Command, CommandKind, UserCommand, WalletCommand};
pub use config::{ConfigError, RaftConfig};
pub use log::{EntryStatus, LogEntry};
pub use message::{AppendEntriesReply, AppendEntriesRequest, VoteReply, VoteRequest};
pub use node::{HardState, NodeId, NodeState, RaftNode, VoteDecision};
