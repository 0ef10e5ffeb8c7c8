//! # replication
//!
//! why: move entries from the leader's log onto followers and answer the leader as a follower
//! relations: driven by node.rs on every heartbeat tick, uses queue.rs, transport.rs and raft-storage
//! what: append_from_queue, prepare_requests, replicate_to_peers fan-out, handle_append_entries

use raft_core::{AppendEntriesReply, AppendEntriesRequest, LogEntry, NodeId, NodeState, RaftNode};
use raft_storage::{Storage, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time;
use tracing::debug;

use crate::error::RpcError;
use crate::queue::CommandSource;
use crate::transport::Transport;

// -- leader side --

/// Turn every queued command into a log entry at the leader's term and
/// persist them in one write. On failure the commands go back on the queue.
pub fn append_from_queue(
    raft: &RaftNode,
    storage: &mut dyn Storage,
    queue: &dyn CommandSource,
) -> Result<usize, StorageError> {
    let drained = queue.drain();
    if drained.is_empty() {
        return Ok(0);
    }

    let appended = storage.log_len().and_then(|last| {
        let entries: Vec<LogEntry> = drained
            .iter()
            .zip(last + 1..)
            .map(|(queued, index)| LogEntry {
                correlation_id: queued.correlation_id.clone(),
                ..LogEntry::new(raft.current_term, index, queued.command.clone())
            })
            .collect();
        storage.append_entries(&entries).map(|()| entries.len())
    });

    if appended.is_err() {
        queue.requeue(drained);
    }
    appended
}

/// One AppendEntries per peer, starting at that peer's next_index
pub fn prepare_requests(
    raft: &RaftNode,
    storage: &dyn Storage,
) -> Result<Vec<(NodeId, AppendEntriesRequest)>, StorageError> {
    let mut requests = Vec::with_capacity(raft.peers.len());
    for peer in &raft.peers {
        let prev_log_index = raft.prev_log_index_for(peer);
        let prev_log_term = storage.term_at(prev_log_index)?.unwrap_or(0);
        let mut entries = storage.entries_from(prev_log_index + 1)?;
        entries.truncate(raft.config.max_entries_per_append);
        requests.push((
            peer.clone(),
            AppendEntriesRequest {
                term: raft.current_term,
                leader_id: raft.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: raft.commit_index,
            },
        ));
    }
    Ok(requests)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    /// The peer now holds everything up to `match_index`
    Accepted { match_index: u64 },
    /// The peer refused; a term above ours means we are stale
    Rejected { term: u64 },
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReply {
    pub peer: NodeId,
    pub outcome: PeerOutcome,
}

/// Everything learned from one replication cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRound {
    /// Leader term the cycle ran in
    pub term: u64,
    pub replies: Vec<PeerReply>,
    /// Set when a peer reported a newer term; remaining calls were cancelled
    pub higher_term: Option<u64>,
}

/// Send every request concurrently, each bounded by `rpc_timeout`.
/// A newer term in any reply ends the round at once.
pub async fn replicate_to_peers(
    transport: Arc<dyn Transport>,
    term: u64,
    requests: Vec<(NodeId, AppendEntriesRequest)>,
    rpc_timeout: Duration,
) -> ReplicationRound {
    let mut calls = JoinSet::new();
    for (peer, request) in requests {
        let transport = Arc::clone(&transport);
        calls.spawn(async move {
            let sent_through = request.last_index();
            let reply = time::timeout(rpc_timeout, transport.append_entries(&peer, request))
                .await
                .unwrap_or_else(|_| Err(RpcError::Timeout(peer.clone())));
            let outcome = match reply {
                Ok(reply) if reply.success => PeerOutcome::Accepted { match_index: sent_through },
                Ok(reply) => PeerOutcome::Rejected { term: reply.term },
                Err(err) => {
                    debug!(peer = %peer, error = %err, "append entries failed");
                    PeerOutcome::Unreachable
                }
            };
            PeerReply { peer, outcome }
        });
    }

    let mut replies = Vec::new();
    while let Some(joined) = calls.join_next().await {
        let Ok(reply) = joined else { continue };
        if let PeerOutcome::Rejected { term: seen } = reply.outcome {
            if seen > term {
                return ReplicationRound { term, replies, higher_term: Some(seen) };
            }
        }
        replies.push(reply);
    }
    ReplicationRound { term, replies, higher_term: None }
}

// -- follower side --

/// Result of handling an inbound AppendEntries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReceipt {
    pub reply: AppendEntriesReply,
    /// Sender is the leader of our term; the election timer restarts
    pub from_leader: bool,
    /// commit_index moved, the apply pipeline should run
    pub commit_advanced: bool,
    /// Entries that were already applied here got cut from the log;
    /// last_applied was pulled back under the new log length
    pub rebuild: bool,
}

impl AppendReceipt {
    fn rejected(term: u64, from_leader: bool) -> Self {
        Self {
            reply: AppendEntriesReply { term, success: false },
            from_leader,
            commit_advanced: false,
            rebuild: false,
        }
    }
}

/// Receiver side of AppendEntries. Writes reach storage before `raft` or the
/// reply reflect them.
///
/// A prev_log_index of 0 matches the empty log: a non-empty local log is
/// cleared before the entries are taken. Any cut pulls commit_index and
/// last_applied back under the surviving log.
pub fn handle_append_entries(
    raft: &mut RaftNode,
    storage: &mut dyn Storage,
    request: &AppendEntriesRequest,
) -> Result<AppendReceipt, StorageError> {
    if request.term < raft.current_term {
        return Ok(AppendReceipt::rejected(raft.current_term, false));
    }

    let leader = Some(request.leader_id.clone());
    match raft.newer_term_state(request.term) {
        Some(hard_state) => {
            storage.save_hard_state(&hard_state)?;
            raft.become_follower(hard_state, leader);
        }
        None if raft.state != NodeState::Follower => {
            let hard_state = raft.hard_state();
            raft.become_follower(hard_state, leader);
        }
        None => raft.leader_id = leader,
    }

    let cleared = if request.prev_log_index == 0 {
        clear_log(storage)?
    } else if storage.term_at(request.prev_log_index)? == Some(request.prev_log_term) {
        None
    } else {
        debug!(
            prev_log_index = request.prev_log_index,
            prev_log_term = request.prev_log_term,
            "rejecting append, previous entry does not match"
        );
        return Ok(AppendReceipt::rejected(raft.current_term, true));
    };

    let cut = cleared.or(merge_entries(storage, &request.entries)?);
    let rebuild = cut.is_some_and(|index| raft.discard_from(index));

    let commit_advanced =
        request.leader_commit > raft.commit_index && raft.advance_commit(request.leader_commit, storage.log_len()?);

    Ok(AppendReceipt {
        reply: AppendEntriesReply { term: raft.current_term, success: true },
        from_leader: true,
        commit_advanced,
        rebuild,
    })
}

/// Empty a non-empty log, returning the first index removed
fn clear_log(storage: &mut dyn Storage) -> Result<Option<u64>, StorageError> {
    if storage.log_len()? == 0 {
        return Ok(None);
    }
    storage.truncate_log_from(1)?;
    Ok(Some(1))
}

/// Skip entries already held with the same term, cut the log at the first
/// conflicting term, append the rest as not yet applied here. Returns the
/// index the log was cut at, if any.
fn merge_entries(storage: &mut dyn Storage, entries: &[LogEntry]) -> Result<Option<u64>, StorageError> {
    for (pos, entry) in entries.iter().enumerate() {
        match storage.term_at(entry.index)? {
            Some(term) if term == entry.term => continue,
            Some(_) => {
                storage.truncate_log_from(entry.index)?;
                append_pending(storage, &entries[pos..])?;
                return Ok(Some(entry.index));
            }
            None => {
                append_pending(storage, &entries[pos..])?;
                return Ok(None);
            }
        }
    }
    Ok(None)
}

fn append_pending(storage: &mut dyn Storage, entries: &[LogEntry]) -> Result<(), StorageError> {
    let fresh: Vec<LogEntry> = entries.iter().map(LogEntry::as_pending).collect();
    storage.append_entries(&fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::transport::stub::OneAhead;
    use raft_core::{Command, EntryStatus, HardState};
    use raft_storage::InMemoryStorage;
    use tokio::time::{sleep, Instant};

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(term, index, Command::App(vec![index as u8]))
    }

    fn follower() -> RaftNode {
        RaftNode::new("c", vec!["a".into(), "b".into(), "c".into()])
    }

    fn append(term: u64, prev: (u64, u64), entries: Vec<LogEntry>, commit: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: "a".into(),
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: commit,
        }
    }

    #[test]
    fn queued_commands_become_entries_at_leader_term() {
        let mut raft = RaftNode::new("a", vec!["a".into(), "b".into()]);
        raft.restore(HardState { term: 3, voted_for: Some("a".into()) });
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[entry(1, 1)]).unwrap();
        let queue = MemoryQueue::new();
        queue.push(Command::App(b"x".to_vec()));
        queue.push_tracked(Command::App(b"y".to_vec()), "req-9");

        let appended = append_from_queue(&raft, &mut storage, &queue).unwrap();

        assert_eq!(appended, 2);
        assert!(queue.is_empty());
        let log = storage.load_log().unwrap();
        assert_eq!((log[1].index, log[1].term), (2, 3));
        assert_eq!(log[2].correlation_id.as_deref(), Some("req-9"));
        assert_eq!(log[2].status, EntryStatus::Pending);
    }

    #[test]
    fn requests_start_at_each_peers_cursor() {
        let mut raft = RaftNode::new("a", vec!["a".into(), "b".into(), "c".into()]);
        raft.restore(HardState { term: 2, voted_for: Some("a".into()) });
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[entry(1, 1), entry(2, 2), entry(2, 3)]).unwrap();
        raft.become_leader(3);
        raft.record_replication_conflict(&"c".into());
        raft.record_replication_conflict(&"c".into());

        let requests = prepare_requests(&raft, &storage).unwrap();

        let (_, to_b) = requests.iter().find(|(p, _)| p.as_str() == "b").unwrap();
        let (_, to_c) = requests.iter().find(|(p, _)| p.as_str() == "c").unwrap();
        assert_eq!((to_b.prev_log_index, to_b.prev_log_term), (3, 2));
        assert!(to_b.is_heartbeat());
        assert_eq!((to_c.prev_log_index, to_c.prev_log_term), (1, 1));
        assert_eq!(to_c.last_index(), 3);
    }

    #[test]
    fn entries_are_capped_per_request() {
        let mut raft = RaftNode::new("a", vec!["a".into(), "b".into()]);
        raft.config.max_entries_per_append = 2;
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();
        raft.become_leader(0);

        let requests = prepare_requests(&raft, &storage).unwrap();

        assert_eq!(requests[0].1.entries.len(), 2);
        assert_eq!(requests[0].1.last_index(), 2);
    }

    #[test]
    fn stale_leader_is_rejected_without_reset() {
        let mut raft = follower();
        raft.restore(HardState { term: 4, voted_for: None });
        let mut storage = InMemoryStorage::new();

        let receipt = handle_append_entries(&mut raft, &mut storage, &append(3, (0, 0), vec![], 0)).unwrap();

        assert_eq!(receipt.reply, AppendEntriesReply { term: 4, success: false });
        assert!(!receipt.from_leader);
    }

    #[test]
    fn newer_term_is_persisted_and_vote_cleared() {
        let mut raft = follower();
        raft.restore(HardState { term: 1, voted_for: Some("b".into()) });
        let mut storage = InMemoryStorage::new();

        let receipt = handle_append_entries(&mut raft, &mut storage, &append(2, (0, 0), vec![], 0)).unwrap();

        assert!(receipt.reply.success);
        assert_eq!(storage.load_hard_state().unwrap(), HardState { term: 2, voted_for: None });
        assert_eq!(raft.leader_id, Some("a".into()));
    }

    #[test]
    fn zero_prev_index_clears_existing_log() {
        let mut raft = follower();
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[entry(1, 1), entry(1, 2)]).unwrap();

        handle_append_entries(&mut raft, &mut storage, &append(2, (0, 0), vec![entry(2, 1)], 0)).unwrap();

        assert_eq!(storage.last_log_info().unwrap(), (1, 2));
    }

    #[test]
    fn clearing_applied_log_pulls_counters_back() {
        let mut raft = follower();
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();
        raft.commit_index = 3;
        raft.last_applied = 3;

        let receipt = handle_append_entries(&mut raft, &mut storage, &append(2, (0, 0), vec![entry(2, 1)], 0)).unwrap();

        assert!(receipt.reply.success);
        assert!(receipt.rebuild);
        assert!(!receipt.commit_advanced);
        assert_eq!(storage.log_len().unwrap(), 1);
        assert_eq!((raft.commit_index, raft.last_applied), (0, 0));
    }

    #[test]
    fn conflict_cut_clamps_applied_cursor() {
        let mut raft = follower();
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();
        raft.commit_index = 3;
        raft.last_applied = 3;

        let receipt =
            handle_append_entries(&mut raft, &mut storage, &append(2, (1, 1), vec![entry(2, 2)], 1)).unwrap();

        assert!(receipt.rebuild);
        assert_eq!(storage.last_log_info().unwrap(), (2, 2));
        assert_eq!((raft.commit_index, raft.last_applied), (1, 1));
    }

    #[test]
    fn cutting_unapplied_tail_needs_no_rebuild() {
        let mut raft = follower();
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[entry(1, 1), entry(1, 2)]).unwrap();
        raft.commit_index = 1;
        raft.last_applied = 1;

        let receipt =
            handle_append_entries(&mut raft, &mut storage, &append(2, (1, 1), vec![entry(2, 2)], 1)).unwrap();

        assert!(!receipt.rebuild);
        assert_eq!((raft.commit_index, raft.last_applied), (1, 1));
    }

    #[test]
    fn missing_prev_entry_is_rejected() {
        let mut raft = follower();
        let mut storage = InMemoryStorage::new();

        let receipt = handle_append_entries(&mut raft, &mut storage, &append(1, (3, 1), vec![entry(1, 4)], 0)).unwrap();

        assert!(!receipt.reply.success);
        assert!(receipt.from_leader);
        assert_eq!(storage.log_len().unwrap(), 0);
    }

    #[test]
    fn replayed_entries_keep_local_status() {
        let mut raft = follower();
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[entry(1, 1), entry(1, 2)]).unwrap();
        storage.set_status(2, EntryStatus::Succeeded).unwrap();

        let receipt =
            handle_append_entries(&mut raft, &mut storage, &append(1, (1, 1), vec![entry(1, 2), entry(1, 3)], 0))
                .unwrap();

        assert!(receipt.reply.success);
        assert_eq!(storage.log_len().unwrap(), 3);
        assert_eq!(storage.entry(2).unwrap().unwrap().status, EntryStatus::Succeeded);
    }

    #[test]
    fn leader_entries_arrive_pending() {
        let mut raft = follower();
        let mut storage = InMemoryStorage::new();
        let mut applied_upstream = entry(1, 1);
        applied_upstream.status = EntryStatus::Succeeded;

        handle_append_entries(&mut raft, &mut storage, &append(1, (0, 0), vec![applied_upstream], 0)).unwrap();

        assert_eq!(storage.entry(1).unwrap().unwrap().status, EntryStatus::Pending);
    }

    #[test]
    fn commit_follows_leader_but_not_past_log() {
        let mut raft = follower();
        let mut storage = InMemoryStorage::new();

        let receipt =
            handle_append_entries(&mut raft, &mut storage, &append(1, (0, 0), vec![entry(1, 1), entry(1, 2)], 5))
                .unwrap();

        assert!(receipt.commit_advanced);
        assert_eq!(raft.commit_index, 2);
    }

    #[test]
    fn candidate_steps_down_for_leader_of_same_term() {
        let mut raft = follower();
        let hs = raft.election_hard_state();
        raft.become_candidate(hs);
        let mut storage = InMemoryStorage::new();

        handle_append_entries(&mut raft, &mut storage, &append(1, (0, 0), vec![], 0)).unwrap();

        assert_eq!(raft.state, NodeState::Follower);
        assert_eq!(raft.voted_for, Some("c".into()));
    }

    #[tokio::test]
    async fn higher_term_reply_cancels_the_rest_of_the_round() {
        let transport = Arc::new(OneAhead::new("b", 9));
        let requests = vec![
            ("c".into(), append(1, (0, 0), vec![], 0)),
            ("b".into(), append(1, (0, 0), vec![], 0)),
        ];
        let started = Instant::now();

        let round = replicate_to_peers(transport.clone(), 1, requests, Duration::from_secs(5)).await;

        assert_eq!(round.higher_term, Some(9));
        assert_eq!(round.term, 1);
        assert!(round.replies.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
        sleep(Duration::from_millis(50)).await;
        assert!(transport.hung_call_dropped());
    }
}
