//! # error
//!
//! why: one error type per failure domain of the running node
//! relations: NodeError flows out of RaftHandle, RpcError out of transports, NodeConfigError out of config.rs
//! what: NodeError, RpcError, NodeConfigError

use raft_core::{ConfigError, NodeId};
use raft_storage::StorageError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the node's event loop and its handle
#[derive(Debug, Error)]
pub enum NodeError {
    /// A durable write or read failed; the operation did not take effect
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The apply pipeline found a hole in the committed range
    #[error("apply pipeline expected index {expected} but found {found}")]
    ApplyGap { expected: u64, found: u64 },

    #[error("invalid raft configuration: {0}")]
    Config(#[from] ConfigError),

    /// The event loop is gone
    #[error("node has stopped")]
    Stopped,
}

/// Errors from a single outbound rpc
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("rpc to {0} timed out")]
    Timeout(NodeId),

    /// The peer received the call but failed to handle it
    #[error("peer failed to handle rpc: {0}")]
    Remote(String),

    #[error("rpc frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("rpc io failed: {0}")]
    Io(#[from] io::Error),

    #[error("rpc codec failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors loading or validating a NodeConfig
#[derive(Debug, Error)]
pub enum NodeConfigError {
    #[error("could not read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("could not parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("node id is required")]
    MissingId,

    #[error("listen_addr is required")]
    MissingListenAddr,

    #[error("peer {0} has no address")]
    MissingPeerAddr(NodeId),

    #[error(transparent)]
    Raft(#[from] ConfigError),
}
