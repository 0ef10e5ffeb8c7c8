//! # raft-node
//!
//! why: run the pure raft-core state machine as a live cluster member
//! relations: drives raft-core decisions, persists through raft-storage, talks to peers via a Transport
//! what: event loop and handle, election timer, election and replication fan-outs, apply pipeline,
//! command queue, ledger state machine, in-process and tcp transports, client rpcs, node config and tracing setup

pub mod apply;
pub mod config;
pub mod election;
pub mod error;
pub mod ledger;
pub mod node;
pub mod queue;
pub mod replication;
pub mod state_machine;
pub mod tcp;
pub mod telemetry;
pub mod timer;
pub mod transport;

pub use config::{NodeConfig, NodeConfigBuilder};
pub use election::ElectionOutcome;
pub use error::{NodeConfigError, NodeError, RpcError};
pub use ledger::Ledger;
pub use node::{NodeBuilder, NodeStatus, RaftHandle, SubmitReply};
pub use queue::{CommandSource, MemoryQueue, QueuedCommand};
pub use state_machine::{ApplyError, StateMachine};
pub use tcp::{serve, Service, TcpClient, TcpTransport};
pub use transport::{LocalEndpoint, LocalNetwork, Transport};
