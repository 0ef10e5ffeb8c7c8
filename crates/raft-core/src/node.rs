//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, config.rs for timing and safety switches
//! what: NodeId, NodeState enum, HardState, RaftNode with election, vote and commit arithmetic
//!
//! Nothing here performs i/o. Every transition that changes `current_term` or
//! `voted_for` is split in two: a pure decision that returns the [`HardState`]
//! to persist, and a mutating call the caller makes only once that state is durable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::config::RaftConfig;
use crate::message::{VoteReply, VoteRequest};

/// Stable identity of a cluster member (its rpc address in practice)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// The persisted singleton: current term and the vote cast in it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// Result of evaluating a RequestVote against local state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteDecision {
    pub granted: bool,
    /// State that must be durable before the reply leaves this node
    pub persist: Option<HardState>,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every other member of the cluster
    pub peers: Vec<NodeId>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    /// Highest index known to be replicated on a quorum
    pub commit_index: u64,
    /// Highest index pushed to the domain state machine
    pub last_applied: u64,
    /// Last known leader, volatile hint
    pub leader_id: Option<NodeId>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<NodeId, u64>,
    /// Leader only: highest index known to be stored on each peer
    pub match_index: HashMap<NodeId, u64>,
}

impl RaftNode {
    /// Create a new Raft node in Follower state. `cluster` may include `id`.
    pub fn new(id: impl Into<NodeId>, cluster: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster, RaftConfig::default())
    }

    pub fn with_config(id: impl Into<NodeId>, cluster: Vec<NodeId>, config: RaftConfig) -> Self {
        let id = id.into();
        let mut peers: Vec<NodeId> = cluster.into_iter().filter(|p| *p != id).collect();
        peers.sort();
        peers.dedup();
        Self {
            id,
            peers,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    /// Load persisted term and vote at startup
    pub fn restore(&mut self, hard_state: HardState) {
        self.current_term = hard_state.term;
        self.voted_for = hard_state.voted_for;
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for.clone(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    /// Members including self
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// floor(N/2) + 1
    pub fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    // -- election --

    /// State to persist before standing as candidate: next term, vote for self
    pub fn election_hard_state(&self) -> HardState {
        HardState {
            term: self.current_term + 1,
            voted_for: Some(self.id.clone()),
        }
    }

    /// Enter candidacy once `hard_state` (from [`Self::election_hard_state`]) is durable
    pub fn become_candidate(&mut self, hard_state: HardState) {
        self.adopt(hard_state);
        self.state = NodeState::Candidate;
        self.leader_id = None;
        self.clear_leader_state();
    }

    pub fn vote_request(&self, last_log_index: u64, last_log_term: u64) -> VoteRequest {
        VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        }
    }

    /// Evaluate a RequestVote. `last_log` is `(index, term)` of the local log.
    pub fn vote_decision(&self, req: &VoteRequest, last_log: (u64, u64)) -> VoteDecision {
        if req.term < self.current_term {
            return VoteDecision { granted: false, persist: None };
        }

        let newer_term = req.term > self.current_term;
        let vote_free = newer_term
            || self.voted_for.is_none()
            || self.voted_for.as_ref() == Some(&req.candidate_id);
        let log_ok = !self.config.check_vote_log_recency || candidate_log_is_current(req, last_log);
        let granted = vote_free && log_ok;

        let persist = if granted {
            let next = HardState {
                term: req.term,
                voted_for: Some(req.candidate_id.clone()),
            };
            (next != self.hard_state()).then_some(next)
        } else if newer_term {
            Some(HardState { term: req.term, voted_for: None })
        } else {
            None
        };

        VoteDecision { granted, persist }
    }

    /// Apply a vote decision whose hard state is already durable and build the reply
    pub fn commit_vote(&mut self, decision: VoteDecision) -> VoteReply {
        if let Some(hard_state) = decision.persist {
            if hard_state.term > self.current_term {
                self.become_follower(hard_state, None);
            } else {
                self.adopt(hard_state);
            }
        }
        VoteReply {
            term: self.current_term,
            vote_granted: decision.granted,
        }
    }

    // -- term tracking --

    /// Hard state to persist when a peer reveals `term`, `None` if it is not newer.
    /// A strictly newer term always clears the vote.
    pub fn newer_term_state(&self, term: u64) -> Option<HardState> {
        (term > self.current_term).then_some(HardState { term, voted_for: None })
    }

    /// Step down. `hard_state` must already be durable.
    pub fn become_follower(&mut self, hard_state: HardState, leader: Option<NodeId>) {
        self.adopt(hard_state);
        self.state = NodeState::Follower;
        self.leader_id = leader;
        self.clear_leader_state();
    }

    pub fn become_leader(&mut self, last_log_index: u64) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id.clone());
        self.next_index = self
            .peers
            .iter()
            .map(|p| (p.clone(), last_log_index + 1))
            .collect();
        self.match_index = self.peers.iter().map(|p| (p.clone(), 0)).collect();
    }

    // -- replication --

    /// prevLogIndex to use for the next AppendEntries to `peer`
    pub fn prev_log_index_for(&self, peer: &NodeId) -> u64 {
        self.next_index.get(peer).copied().unwrap_or(1).saturating_sub(1)
    }

    /// Peer acknowledged everything up to `matched`
    pub fn record_replication_success(&mut self, peer: &NodeId, matched: u64) {
        let current = self.match_index.entry(peer.clone()).or_insert(0);
        *current = (*current).max(matched);
        let matched = *current;
        let next = self.next_index.entry(peer.clone()).or_insert(1);
        *next = (*next).max(matched + 1);
    }

    /// Peer refused on a prevLog mismatch: walk its cursor back by one
    pub fn record_replication_conflict(&mut self, peer: &NodeId) {
        let next = self.next_index.entry(peer.clone()).or_insert(1);
        *next = next.saturating_sub(1).max(1);
    }

    /// Highest index present on a quorum, counting self at `own_last_index`
    pub fn quorum_match_index(&self, own_last_index: u64) -> u64 {
        let mut indexes: Vec<u64> = self
            .peers
            .iter()
            .map(|p| self.match_index.get(p).copied().unwrap_or(0))
            .collect();
        indexes.push(own_last_index);
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes[self.quorum_size() - 1]
    }

    /// Index the leader may commit next, if any. `term_at` looks up local entry terms.
    pub fn commit_candidate(
        &self,
        own_last_index: u64,
        term_at: impl Fn(u64) -> Option<u64>,
    ) -> Option<u64> {
        let replicated = self.quorum_match_index(own_last_index);
        if replicated <= self.commit_index {
            return None;
        }
        if !self.config.commit_requires_current_term {
            return Some(replicated);
        }
        (self.commit_index + 1..=replicated)
            .rev()
            .find(|&i| term_at(i) == Some(self.current_term))
    }

    /// Move commit_index forward, clamped to the log length. Returns true if it moved.
    pub fn advance_commit(&mut self, index: u64, log_len: u64) -> bool {
        let target = index.min(log_len);
        if target > self.commit_index {
            self.commit_index = target;
            true
        } else {
            false
        }
    }

    /// The local log lost every entry from `index` on. Pulls commit_index and
    /// last_applied back under the new length; returns true when applied
    /// entries were among the discarded ones.
    pub fn discard_from(&mut self, index: u64) -> bool {
        let kept = index.saturating_sub(1);
        self.commit_index = self.commit_index.min(kept);
        if self.last_applied > kept {
            self.last_applied = kept;
            true
        } else {
            false
        }
    }

    fn adopt(&mut self, hard_state: HardState) {
        // terms never go backwards
        if hard_state.term >= self.current_term {
            self.current_term = hard_state.term;
            self.voted_for = hard_state.voted_for;
        }
    }

    fn clear_leader_state(&mut self) {
        self.next_index.clear();
        self.match_index.clear();
    }
}

fn candidate_log_is_current(req: &VoteRequest, (last_index, last_term): (u64, u64)) -> bool {
    req.last_log_term > last_term || (req.last_log_term == last_term && req.last_log_index >= last_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|id| NodeId::from(*id)).collect()
    }

    #[test]
    fn new_node_starts_as_follower() {
        let node = RaftNode::new("a", cluster(&["a", "b", "c"]));
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.voted_for, None);
        assert_eq!(node.peers, cluster(&["b", "c"]));
    }

    #[test]
    fn discard_pulls_counters_under_new_length() {
        let mut node = RaftNode::new("a", cluster(&["a", "b", "c"]));
        node.commit_index = 5;
        node.last_applied = 4;

        assert!(node.discard_from(3));
        assert_eq!((node.commit_index, node.last_applied), (2, 2));

        assert!(!node.discard_from(9));
        assert_eq!((node.commit_index, node.last_applied), (2, 2));
    }

    #[test]
    fn clearing_whole_log_resets_counters() {
        let mut node = RaftNode::new("a", cluster(&["a", "b"]));
        node.commit_index = 2;
        node.last_applied = 2;

        assert!(node.discard_from(1));
        assert_eq!((node.commit_index, node.last_applied), (0, 0));
    }

    #[test]
    fn adopt_never_lowers_term() {
        let mut node = RaftNode::new("a", cluster(&["a", "b", "c"]));
        node.restore(HardState { term: 5, voted_for: None });
        node.become_follower(HardState { term: 3, voted_for: None }, None);
        assert_eq!(node.current_term, 5);
    }

    #[test]
    fn refused_vote_on_newer_term_still_persists_term() {
        let mut config = RaftConfig::default();
        config.check_vote_log_recency = true;
        let node = RaftNode::with_config("a", cluster(&["a", "b", "c"]), config);

        let req = VoteRequest {
            term: 4,
            candidate_id: "b".into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        let decision = node.vote_decision(&req, (3, 2));
        assert!(!decision.granted);
        assert_eq!(decision.persist, Some(HardState { term: 4, voted_for: None }));
    }
}
