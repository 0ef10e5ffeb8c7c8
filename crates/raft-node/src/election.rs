//! # election
//!
//! why: run one election round and answer other candidates
//! relations: spawned by node.rs on ElectionTimeout, uses transport.rs, persists through raft-storage
//! what: collect_votes fan-out, ElectionOutcome, handle_request_vote

use raft_core::{NodeId, RaftNode, VoteReply, VoteRequest};
use raft_storage::{Storage, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::error::RpcError;
use crate::transport::Transport;

/// How one election round ended, from the candidate's side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Quorum of grants, self included
    Won { votes: usize },
    /// Every reply settled, or the deadline passed, short of quorum
    Lost { votes: usize },
    /// A voter is ahead; the candidate must step down to this term
    HigherTerm(u64),
}

/// Ask every peer for its vote concurrently and tally.
///
/// Each call is bounded by `rpc_timeout`; the whole round by `deadline`.
/// Returning drops the JoinSet, which aborts the calls still in flight.
pub async fn collect_votes(
    transport: Arc<dyn Transport>,
    peers: &[NodeId],
    request: VoteRequest,
    quorum: usize,
    rpc_timeout: Duration,
    deadline: Duration,
) -> ElectionOutcome {
    let mut votes = 1;
    if votes >= quorum {
        return ElectionOutcome::Won { votes };
    }

    let mut calls = JoinSet::new();
    for peer in peers {
        let transport = Arc::clone(&transport);
        let request = request.clone();
        let peer = peer.clone();
        calls.spawn(async move {
            let reply = time::timeout(rpc_timeout, transport.request_vote(&peer, request))
                .await
                .unwrap_or_else(|_| Err(RpcError::Timeout(peer.clone())));
            (peer, reply)
        });
    }

    let give_up = Instant::now() + deadline;
    loop {
        let joined = match time::timeout_at(give_up, calls.join_next()).await {
            Ok(Some(joined)) => joined,
            Ok(None) => break,
            Err(_) => {
                debug!(term = request.term, "election deadline elapsed");
                break;
            }
        };
        let Ok((peer, reply)) = joined else { continue };
        match reply {
            Ok(reply) => {
                if reply.term > request.term {
                    debug!(peer = %peer, term = reply.term, "voter is ahead");
                    return ElectionOutcome::HigherTerm(reply.term);
                }
                if reply.vote_granted {
                    votes += 1;
                    debug!(peer = %peer, votes, "vote granted");
                    if votes >= quorum {
                        return ElectionOutcome::Won { votes };
                    }
                }
            }
            Err(err) => debug!(peer = %peer, error = %err, "vote request failed"),
        }
    }
    ElectionOutcome::Lost { votes }
}

/// Result of handling an inbound RequestVote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteReceipt {
    pub reply: VoteReply,
    /// The vote was granted, so the election timer restarts
    pub reset_timer: bool,
}

/// Receiver side of RequestVote. Any term/vote change is durable before
/// `raft` changes; on a storage error `raft` is left as it was.
pub fn handle_request_vote(
    raft: &mut RaftNode,
    storage: &mut dyn Storage,
    request: &VoteRequest,
) -> Result<VoteReceipt, StorageError> {
    let decision = raft.vote_decision(request, storage.last_log_info()?);
    if let Some(hard_state) = &decision.persist {
        storage.save_hard_state(hard_state)?;
    }
    let reset_timer = decision.granted;
    let reply = raft.commit_vote(decision);
    Ok(VoteReceipt { reply, reset_timer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::stub::OneAhead;
    use raft_core::HardState;
    use raft_storage::InMemoryStorage;
    use tokio::time::sleep;

    fn node() -> RaftNode {
        RaftNode::new("b", vec!["a".into(), "b".into(), "c".into()])
    }

    fn request(term: u64, candidate: &str) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: candidate.into(),
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[test]
    fn grant_is_persisted_before_reply() {
        let mut raft = node();
        let mut storage = InMemoryStorage::new();

        let receipt = handle_request_vote(&mut raft, &mut storage, &request(1, "a")).unwrap();

        assert!(receipt.reply.vote_granted);
        assert!(receipt.reset_timer);
        assert_eq!(
            storage.load_hard_state().unwrap(),
            HardState { term: 1, voted_for: Some("a".into()) }
        );
        assert_eq!(raft.voted_for, Some("a".into()));
    }

    #[test]
    fn second_candidate_in_same_term_is_refused() {
        let mut raft = node();
        let mut storage = InMemoryStorage::new();
        handle_request_vote(&mut raft, &mut storage, &request(1, "a")).unwrap();

        let receipt = handle_request_vote(&mut raft, &mut storage, &request(1, "c")).unwrap();

        assert!(!receipt.reply.vote_granted);
        assert!(!receipt.reset_timer);
        assert_eq!(receipt.reply.term, 1);
    }

    #[test]
    fn stale_candidate_gets_current_term() {
        let mut raft = node();
        raft.restore(HardState { term: 5, voted_for: None });
        let mut storage = InMemoryStorage::new();

        let receipt = handle_request_vote(&mut raft, &mut storage, &request(3, "a")).unwrap();

        assert_eq!(receipt.reply, VoteReply { term: 5, vote_granted: false });
    }

    #[tokio::test]
    async fn higher_term_ends_round_without_waiting_for_hung_voter() {
        let transport = Arc::new(OneAhead::new("a", 9));
        // hung voter first so its call is in flight before the refusal lands
        let peers: Vec<NodeId> = vec!["c".into(), "a".into()];
        let started = Instant::now();

        let outcome = collect_votes(
            transport.clone(),
            &peers,
            request(1, "b"),
            2,
            Duration::from_secs(5),
            Duration::from_secs(10),
        )
        .await;

        assert_eq!(outcome, ElectionOutcome::HigherTerm(9));
        assert!(started.elapsed() < Duration::from_secs(1));
        sleep(Duration::from_millis(50)).await;
        assert!(transport.hung_call_dropped());
    }
}
