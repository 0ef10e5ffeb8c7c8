//! # node
//!
//! why: own all consensus state in one task so rpc handlers, elections and replication never interleave
//! relations: wires raft-core RaftNode, raft-storage, timer.rs, election.rs, replication.rs, apply.rs
//! what: NodeBuilder, RaftHandle, NodeStatus, SubmitReply, the event loop
//!
//! Every mutation of term, vote, role, commit and cursors happens inside
//! `EventLoop::run`. Outbound fan-outs run as separate tasks and report back
//! as events, so the loop keeps answering rpcs while they are in flight.

use raft_core::{
    AppendEntriesReply, AppendEntriesRequest, EntryStatus, LogEntry, NodeId, NodeState, RaftConfig, RaftNode,
    VoteReply, VoteRequest,
};
use raft_storage::Storage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::apply::apply_committed;
use crate::election::{self, ElectionOutcome};
use crate::error::NodeError;
use crate::ledger::Ledger;
use crate::queue::{CommandSource, MemoryQueue, QueuedCommand};
use crate::replication::{self, PeerOutcome, ReplicationRound};
use crate::state_machine::StateMachine;
use crate::timer::ElectionTimer;
use crate::transport::Transport;

/// Snapshot of a node's consensus state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Answer to a client submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitReply {
    /// Queued on the leader; it becomes an entry on the next replication cycle
    Accepted,
    /// Only the leader takes commands. Carries the leader this node last heard from.
    NotLeader { leader_id: Option<NodeId> },
}

/// Everything the event loop reacts to
pub(crate) enum Event {
    RequestVote {
        request: VoteRequest,
        reply: oneshot::Sender<Result<VoteReply, NodeError>>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<Result<AppendEntriesReply, NodeError>>,
    },
    Status {
        reply: oneshot::Sender<Result<NodeStatus, NodeError>>,
    },
    LogEntries {
        reply: oneshot::Sender<Result<Vec<LogEntry>, NodeError>>,
    },
    EntryStatus {
        correlation_id: String,
        reply: oneshot::Sender<Result<Option<EntryStatus>, NodeError>>,
    },
    Submit {
        command: QueuedCommand,
        reply: oneshot::Sender<Result<SubmitReply, NodeError>>,
    },
    ElectionTimeout,
    ElectionFinished {
        term: u64,
        outcome: ElectionOutcome,
    },
    ReplicationFinished(ReplicationRound),
    Shutdown,
}

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct RaftHandle {
    id: NodeId,
    events: mpsc::UnboundedSender<Event>,
}

impl RaftHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Inbound RequestVote
    pub async fn request_vote(&self, request: VoteRequest) -> Result<VoteReply, NodeError> {
        self.call(|reply| Event::RequestVote { request, reply }).await?
    }

    /// Inbound AppendEntries
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesReply, NodeError> {
        self.call(|reply| Event::AppendEntries { request, reply }).await?
    }

    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        self.call(|reply| Event::Status { reply }).await?
    }

    /// Copy of the whole local log
    pub async fn log_entries(&self) -> Result<Vec<LogEntry>, NodeError> {
        self.call(|reply| Event::LogEntries { reply }).await?
    }

    /// Apply status of the most recent entry tagged with `correlation_id`
    pub async fn entry_status(&self, correlation_id: impl Into<String>) -> Result<Option<EntryStatus>, NodeError> {
        let correlation_id = correlation_id.into();
        self.call(|reply| Event::EntryStatus { correlation_id, reply }).await?
    }

    /// Hand a command to this node. Only a leader queues it.
    pub async fn submit(&self, command: QueuedCommand) -> Result<SubmitReply, NodeError> {
        self.call(|reply| Event::Submit { command, reply }).await?
    }

    /// Ask the event loop to stop. Later calls on any handle fail with `Stopped`.
    pub fn shutdown(&self) -> Result<(), NodeError> {
        self.events.send(Event::Shutdown).map_err(|_| NodeError::Stopped)
    }

    async fn call<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.events.send(event(tx)).map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }
}

/// Assembles a node from its collaborators and starts it
pub struct NodeBuilder {
    id: NodeId,
    cluster: Vec<NodeId>,
    config: RaftConfig,
    storage: Box<dyn Storage>,
    transport: Arc<dyn Transport>,
    queue: Arc<dyn CommandSource>,
    machine: Box<dyn StateMachine>,
}

impl NodeBuilder {
    /// `cluster` lists every member and may include `id`. Defaults: an empty
    /// MemoryQueue and a fresh Ledger.
    pub fn new(
        id: impl Into<NodeId>,
        cluster: Vec<NodeId>,
        storage: impl Storage + 'static,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id: id.into(),
            cluster,
            config: RaftConfig::default(),
            storage: Box::new(storage),
            transport,
            queue: Arc::new(MemoryQueue::new()),
            machine: Box::new(Ledger::new()),
        }
    }

    pub fn config(mut self, config: RaftConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue(mut self, queue: Arc<dyn CommandSource>) -> Self {
        self.queue = queue;
        self
    }

    pub fn state_machine(mut self, machine: impl StateMachine + 'static) -> Self {
        self.machine = Box::new(machine);
        self
    }

    /// Restore term and vote from storage and spawn the event loop and its
    /// election timer. Must be called inside a tokio runtime.
    pub fn spawn(self) -> Result<RaftHandle, NodeError> {
        self.config.validate()?;
        let hard_state = self.storage.load_hard_state()?;

        let mut raft = RaftNode::with_config(self.id.clone(), self.cluster, self.config);
        raft.restore(hard_state);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let timer = ElectionTimer::spawn(raft.config.election_range(), events_tx.clone());

        info!(node = %raft.id, term = raft.current_term, peers = raft.peers.len(), "starting node");

        let event_loop = EventLoop {
            raft,
            storage: self.storage,
            transport: self.transport,
            queue: self.queue,
            machine: self.machine,
            timer,
            events_tx: events_tx.clone(),
            events: events_rx,
            election: None,
            replication: None,
        };
        tokio::spawn(event_loop.run());

        Ok(RaftHandle { id: self.id, events: events_tx })
    }
}

struct EventLoop {
    raft: RaftNode,
    storage: Box<dyn Storage>,
    transport: Arc<dyn Transport>,
    queue: Arc<dyn CommandSource>,
    machine: Box<dyn StateMachine>,
    timer: ElectionTimer,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    /// In-flight vote collection and the term it campaigns for
    election: Option<(u64, JoinHandle<()>)>,
    /// In-flight replication cycle and its leader term, at most one
    replication: Option<(u64, JoinHandle<()>)>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.raft.config.heartbeat());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle(event) {
                        break;
                    }
                }
                _ = heartbeat.tick() => self.start_replication(),
            }
        }

        self.abort_election();
        self.abort_replication();
        info!(node = %self.raft.id, "node stopped");
    }

    /// Returns false once the loop should exit
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::RequestVote { request, reply } => {
                let _ = reply.send(self.on_request_vote(&request));
            }
            Event::AppendEntries { request, reply } => {
                let _ = reply.send(self.on_append_entries(&request));
            }
            Event::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Event::LogEntries { reply } => {
                let _ = reply.send(self.storage.load_log().map_err(NodeError::from));
            }
            Event::EntryStatus { correlation_id, reply } => {
                let found = self
                    .storage
                    .find_by_correlation(&correlation_id)
                    .map(|entry| entry.map(|e| e.status))
                    .map_err(NodeError::from);
                let _ = reply.send(found);
            }
            Event::Submit { command, reply } => {
                let _ = reply.send(Ok(self.on_submit(command)));
            }
            Event::ElectionTimeout => {
                if !self.raft.is_leader() {
                    self.start_election();
                }
            }
            Event::ElectionFinished { term, outcome } => self.on_election_finished(term, outcome),
            Event::ReplicationFinished(round) => self.on_replication_finished(round),
            Event::Shutdown => return false,
        }
        true
    }

    fn status(&self) -> Result<NodeStatus, NodeError> {
        let (last_log_index, last_log_term) = self.storage.last_log_info()?;
        Ok(NodeStatus {
            id: self.raft.id.clone(),
            state: self.raft.state,
            term: self.raft.current_term,
            voted_for: self.raft.voted_for.clone(),
            leader_id: self.raft.leader_id.clone(),
            commit_index: self.raft.commit_index,
            last_applied: self.raft.last_applied,
            last_log_index,
            last_log_term,
        })
    }

    // -- inbound rpcs --

    fn on_submit(&self, command: QueuedCommand) -> SubmitReply {
        if !self.raft.is_leader() {
            return SubmitReply::NotLeader { leader_id: self.raft.leader_id.clone() };
        }
        debug!(node = %self.raft.id, kind = %command.command.kind(), "queued client command");
        self.queue.enqueue(command);
        SubmitReply::Accepted
    }

    fn on_request_vote(&mut self, request: &VoteRequest) -> Result<VoteReply, NodeError> {
        let previous = self.raft.state;
        let receipt = election::handle_request_vote(&mut self.raft, self.storage.as_mut(), request)
            .inspect_err(|err| warn!(node = %self.raft.id, error = %err, "could not persist vote"))?;
        debug!(
            node = %self.raft.id,
            candidate = %request.candidate_id,
            term = request.term,
            granted = receipt.reply.vote_granted,
            "handled vote request"
        );
        if receipt.reset_timer {
            self.timer.reset();
        }
        self.after_transition(previous);
        Ok(receipt.reply)
    }

    fn on_append_entries(&mut self, request: &AppendEntriesRequest) -> Result<AppendEntriesReply, NodeError> {
        let previous = self.raft.state;
        let receipt = replication::handle_append_entries(&mut self.raft, self.storage.as_mut(), request)
            .inspect_err(|err| warn!(node = %self.raft.id, error = %err, "could not persist append"))?;
        if !request.is_heartbeat() {
            debug!(
                node = %self.raft.id,
                leader = %request.leader_id,
                entries = request.entries.len(),
                success = receipt.reply.success,
                "handled append entries"
            );
        }
        if receipt.from_leader {
            self.timer.reset();
        }
        self.after_transition(previous);
        if receipt.rebuild {
            self.rebuild_after_cut();
        }
        if receipt.commit_advanced || receipt.rebuild {
            self.apply();
        }
        Ok(receipt.reply)
    }

    // -- election --

    fn start_election(&mut self) {
        let hard_state = self.raft.election_hard_state();
        if let Err(err) = self.storage.save_hard_state(&hard_state) {
            error!(node = %self.raft.id, error = %err, "could not persist candidacy, staying put");
            return;
        }
        let (last_index, last_term) = match self.storage.last_log_info() {
            Ok(last) => last,
            Err(err) => {
                error!(node = %self.raft.id, error = %err, "could not read log tail");
                return;
            }
        };

        let previous = self.raft.state;
        self.raft.become_candidate(hard_state);
        self.after_transition(previous);
        info!(node = %self.raft.id, term = self.raft.current_term, "starting election");

        let request = self.raft.vote_request(last_index, last_term);
        let term = self.raft.current_term;
        let transport = Arc::clone(&self.transport);
        let peers = self.raft.peers.clone();
        let quorum = self.raft.quorum_size();
        let rpc_timeout = self.raft.config.rpc_deadline();
        let (_, deadline) = self.raft.config.election_range();
        let events = self.events_tx.clone();

        self.abort_election();
        let task = tokio::spawn(async move {
            let outcome = election::collect_votes(transport, &peers, request, quorum, rpc_timeout, deadline).await;
            let _ = events.send(Event::ElectionFinished { term, outcome });
        });
        self.election = Some((term, task));
    }

    fn on_election_finished(&mut self, term: u64, outcome: ElectionOutcome) {
        if self.election.as_ref().is_some_and(|(running, _)| *running == term) {
            self.election = None;
        }
        if self.raft.state != NodeState::Candidate || self.raft.current_term != term {
            debug!(node = %self.raft.id, term, "ignoring stale election outcome");
            return;
        }

        match outcome {
            ElectionOutcome::Won { votes } => {
                let last_index = match self.storage.log_len() {
                    Ok(len) => len,
                    Err(err) => {
                        error!(node = %self.raft.id, error = %err, "could not read log length, abandoning win");
                        return;
                    }
                };
                self.raft.become_leader(last_index);
                self.timer.stop();
                info!(node = %self.raft.id, term, votes, "became leader");
                self.start_replication();
            }
            ElectionOutcome::Lost { votes } => {
                info!(node = %self.raft.id, term, votes, "election lost");
                let hard_state = self.raft.hard_state();
                self.raft.become_follower(hard_state, None);
                self.timer.reset();
            }
            ElectionOutcome::HigherTerm(seen) => self.step_down(seen),
        }
    }

    /// Persist a newer term, then fall back to follower
    fn step_down(&mut self, term: u64) {
        let Some(hard_state) = self.raft.newer_term_state(term) else {
            return;
        };
        if let Err(err) = self.storage.save_hard_state(&hard_state) {
            error!(node = %self.raft.id, error = %err, "could not persist newer term");
            return;
        }
        let previous = self.raft.state;
        self.raft.become_follower(hard_state, None);
        info!(node = %self.raft.id, term, "stepped down for newer term");
        self.timer.reset();
        self.after_transition(previous);
    }

    // -- replication --

    fn start_replication(&mut self) {
        if !self.raft.is_leader() || self.replication.is_some() {
            return;
        }

        match replication::append_from_queue(&self.raft, self.storage.as_mut(), self.queue.as_ref()) {
            Ok(0) => {}
            Ok(appended) => debug!(node = %self.raft.id, appended, "appended queued commands"),
            Err(err) => {
                warn!(node = %self.raft.id, error = %err, "could not append queued commands, skipping cycle");
                return;
            }
        }

        let requests = match replication::prepare_requests(&self.raft, self.storage.as_ref()) {
            Ok(requests) => requests,
            Err(err) => {
                warn!(node = %self.raft.id, error = %err, "could not build append requests");
                return;
            }
        };
        if requests.is_empty() {
            // single member: own log is the quorum
            self.advance_commit();
            return;
        }

        let term = self.raft.current_term;
        let transport = Arc::clone(&self.transport);
        let rpc_timeout = self.raft.config.rpc_deadline();
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let round = replication::replicate_to_peers(transport, term, requests, rpc_timeout).await;
            let _ = events.send(Event::ReplicationFinished(round));
        });
        self.replication = Some((term, task));
    }

    fn on_replication_finished(&mut self, round: ReplicationRound) {
        // a cycle aborted on step-down may still report after a newer one started
        if self.replication.as_ref().is_some_and(|(running, _)| *running == round.term) {
            self.replication = None;
        }
        if let Some(term) = round.higher_term {
            self.step_down(term);
            return;
        }
        if !self.raft.is_leader() || round.term != self.raft.current_term {
            return;
        }

        for reply in &round.replies {
            match reply.outcome {
                PeerOutcome::Accepted { match_index } => self.raft.record_replication_success(&reply.peer, match_index),
                PeerOutcome::Rejected { .. } => {
                    self.raft.record_replication_conflict(&reply.peer);
                    debug!(
                        node = %self.raft.id,
                        peer = %reply.peer,
                        next_index = self.raft.next_index.get(&reply.peer).copied().unwrap_or(1),
                        "peer log diverges, backing off"
                    );
                }
                PeerOutcome::Unreachable => {}
            }
        }
        self.advance_commit();
    }

    fn advance_commit(&mut self) {
        let own_last = match self.storage.log_len() {
            Ok(len) => len,
            Err(err) => {
                warn!(node = %self.raft.id, error = %err, "could not read log length");
                return;
            }
        };
        let storage = &self.storage;
        let candidate = self
            .raft
            .commit_candidate(own_last, |index| storage.term_at(index).ok().flatten());
        if let Some(index) = candidate {
            if self.raft.advance_commit(index, own_last) {
                debug!(node = %self.raft.id, commit_index = self.raft.commit_index, "commit advanced");
            }
        }
        self.apply();
    }

    /// Applied entries were cut from the log. A volatile machine starts over
    /// from index 1; a durable one keeps effects it cannot undo.
    fn rebuild_after_cut(&mut self) {
        if self.machine.is_durable() {
            warn!(
                node = %self.raft.id,
                last_applied = self.raft.last_applied,
                "applied entries were cut from the log, durable state machine keeps their effects"
            );
            return;
        }
        warn!(node = %self.raft.id, "applied entries were cut from the log, replaying state machine");
        self.machine.reset();
        self.raft.last_applied = 0;
    }

    fn apply(&mut self) {
        if let Err(err) = apply_committed(&mut self.raft, self.storage.as_mut(), self.machine.as_mut()) {
            error!(node = %self.raft.id, error = %err, "apply pipeline stopped");
        }
    }

    // -- bookkeeping --

    /// Log role changes and cancel work that belonged to the old role
    fn after_transition(&mut self, previous: NodeState) {
        let current = self.raft.state;
        if previous == current {
            return;
        }
        info!(node = %self.raft.id, term = self.raft.current_term, from = ?previous, to = ?current, "role changed");
        if previous == NodeState::Leader {
            self.abort_replication();
            self.timer.reset();
        }
        if previous == NodeState::Candidate {
            self.abort_election();
        }
    }

    fn abort_election(&mut self) {
        if let Some((_, task)) = self.election.take() {
            task.abort();
        }
    }

    fn abort_replication(&mut self) {
        if let Some((_, task)) = self.replication.take() {
            task.abort();
        }
    }
}
