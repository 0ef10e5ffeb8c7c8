//! # transport
//!
//! why: decouple the consensus loop from how rpcs travel between members
//! relations: called by election.rs and replication.rs fan-outs; tcp.rs is the network implementation
//! what: Transport trait, LocalNetwork in-process router with partition control

use async_trait::async_trait;
use parking_lot::RwLock;
use raft_core::{AppendEntriesReply, AppendEntriesRequest, NodeId, VoteReply, VoteRequest};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{NodeError, RpcError};
use crate::node::RaftHandle;

/// Outbound raft rpcs. Callers bound each call with their own timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteReply, RpcError>;

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, RpcError>;
}

#[derive(Default)]
struct Registry {
    nodes: RwLock<HashMap<NodeId, RaftHandle>>,
    isolated: RwLock<HashSet<NodeId>>,
}

/// In-process network connecting node handles directly.
///
/// An isolated node can neither send nor receive; calls touching it fail
/// with `RpcError::Unreachable` at once.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<Registry>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for the node `id`, used to tell which side of a partition a call starts on
    pub fn endpoint(&self, id: impl Into<NodeId>) -> Arc<LocalEndpoint> {
        Arc::new(LocalEndpoint {
            network: self.clone(),
            from: id.into(),
        })
    }

    pub fn register(&self, handle: RaftHandle) {
        self.registry.nodes.write().insert(handle.id().clone(), handle);
    }

    /// Cut `id` off from every other member
    pub fn isolate(&self, id: &NodeId) {
        tracing::debug!(node = %id, "isolating");
        self.registry.isolated.write().insert(id.clone());
    }

    pub fn heal(&self, id: &NodeId) {
        tracing::debug!(node = %id, "healing");
        self.registry.isolated.write().remove(id);
    }

    pub fn heal_all(&self) {
        self.registry.isolated.write().clear();
    }

    fn route(&self, from: &NodeId, to: &NodeId) -> Result<RaftHandle, RpcError> {
        {
            let isolated = self.registry.isolated.read();
            if isolated.contains(from) || isolated.contains(to) {
                return Err(RpcError::Unreachable(to.clone()));
            }
        }
        self.registry
            .nodes
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| RpcError::Unreachable(to.clone()))
    }
}

/// One node's view of a LocalNetwork
pub struct LocalEndpoint {
    network: LocalNetwork,
    from: NodeId,
}

fn remote(target: &NodeId, err: NodeError) -> RpcError {
    match err {
        NodeError::Stopped => RpcError::Unreachable(target.clone()),
        other => RpcError::Remote(other.to_string()),
    }
}

#[async_trait]
impl Transport for LocalEndpoint {
    async fn request_vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteReply, RpcError> {
        let handle = self.network.route(&self.from, target)?;
        handle.request_vote(request).await.map_err(|e| remote(target, e))
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, RpcError> {
        let handle = self.network.route(&self.from, target)?;
        handle.append_entries(request).await.map_err(|e| remote(target, e))
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use std::future;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Raises its flag when dropped
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// `ahead` refuses at once from `term`; every other peer never answers
    pub(crate) struct OneAhead {
        pub ahead: NodeId,
        pub term: u64,
        /// Set once a never-answering call has been dropped
        pub hung_dropped: Arc<AtomicBool>,
    }

    impl OneAhead {
        pub(crate) fn new(ahead: &str, term: u64) -> Self {
            Self {
                ahead: ahead.into(),
                term,
                hung_dropped: Arc::new(AtomicBool::new(false)),
            }
        }

        pub(crate) fn hung_call_dropped(&self) -> bool {
            self.hung_dropped.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for OneAhead {
        async fn request_vote(&self, target: &NodeId, _request: VoteRequest) -> Result<VoteReply, RpcError> {
            if *target == self.ahead {
                return Ok(VoteReply { term: self.term, vote_granted: false });
            }
            let _flag = DropFlag(Arc::clone(&self.hung_dropped));
            future::pending().await
        }

        async fn append_entries(
            &self,
            target: &NodeId,
            _request: AppendEntriesRequest,
        ) -> Result<AppendEntriesReply, RpcError> {
            if *target == self.ahead {
                return Ok(AppendEntriesReply { term: self.term, success: false });
            }
            let _flag = DropFlag(Arc::clone(&self.hung_dropped));
            future::pending().await
        }
    }
}
