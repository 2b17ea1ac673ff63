//! # actor
//!
//! why: own all of one node's protocol state behind a single task, so every
//! mutation happens one command at a time
//! relations: driven by ConsensusManager commands, peer envelopes and its own ticker;
//! persists through concord-storage, talks to peers through Transport
//! what: Command enum, ConsensusActor run loop, persistence flush, fact delivery to the leader

use std::sync::Arc;
use std::time::Instant;

use concord_core::error::parse_id;
use concord_core::{
    Envelope, FactId, FactOutbox, LockTable, LogEntry, MembershipView, NarrativeId, NodeId,
    NodeStatus, RaftMessage, RaftNode, Snapshot, Term, VoteLedger,
};
use concord_storage::{Storage, StorageError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::FederationConfig;
use crate::error::Result;
use crate::transport::{Inbox, Transport};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Result of a facade AppendEntries call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub success: bool,
    /// Responder's term after handling the call
    pub term: Term,
}

/// Result of a facade RequestVote call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteOutcome {
    pub granted: bool,
    pub term: Term,
}

pub(crate) enum Command {
    AcquireLock {
        narrative_id: NarrativeId,
        node_id: NodeId,
        reply: Reply<bool>,
    },
    ReleaseLock {
        narrative_id: NarrativeId,
        reply: Reply<()>,
    },
    ProposeFact {
        fact_id: FactId,
        voter: Option<String>,
        reply: Reply<bool>,
    },
    Heartbeat {
        leader_id: NodeId,
        reply: Reply<()>,
    },
    StartElection {
        reply: Reply<()>,
    },
    AppendEntries {
        leader_id: NodeId,
        term: Term,
        entry: LogEntry,
        reply: Reply<AppendOutcome>,
    },
    RequestVote {
        candidate_id: NodeId,
        term: Term,
        last_log_index: u64,
        last_log_term: Term,
        reply: Reply<VoteOutcome>,
    },
    CommitLog {
        index: u64,
        reply: Reply<Vec<LogEntry>>,
    },
    SnapshotState {
        reply: Reply<Snapshot>,
    },
    SyncMembership {
        nodes: Vec<NodeId>,
        reply: Reply<()>,
    },
    CheckLease {
        node_id: NodeId,
        reply: Reply<bool>,
    },
    VerifyChecksum {
        checksum: String,
        reply: Reply<bool>,
    },
    Status {
        reply: Reply<NodeStatus>,
    },
}

/// Protocol clock; follows tokio's clock so paused-time tests stay consistent
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub(crate) struct ConsensusActor {
    config: FederationConfig,
    node: RaftNode,
    locks: LockTable,
    ledger: VoteLedger,
    membership: MembershipView,
    storage: Box<dyn Storage>,
    transport: Arc<dyn Transport>,
    /// Quorum-reached facts the replicated log has not committed yet
    outbox: FactOutbox,
    persisted_hard_state: (Term, Option<NodeId>),
    /// Index and checksum of the snapshot storage holds
    persisted_snapshot: Option<(u64, String)>,
    /// Last retransfer request sent while diverged
    last_retransfer: Option<Instant>,
    commands: mpsc::Receiver<Command>,
    inbox: Inbox,
    shutdown: watch::Receiver<bool>,
}

impl ConsensusActor {
    /// Rebuild node state from `storage` and wire up the channels
    pub(crate) fn new(
        config: FederationConfig,
        storage: Box<dyn Storage>,
        transport: Arc<dyn Transport>,
        commands: mpsc::Receiver<Command>,
        inbox: Inbox,
        shutdown: watch::Receiver<bool>,
    ) -> std::result::Result<Self, StorageError> {
        let (term, voted_for) = storage.load_term_and_vote()?;
        let snapshot = storage.load_snapshot()?;
        let entries = storage.load_log()?;
        let persisted_snapshot = snapshot
            .as_ref()
            .map(|s| (s.last_included_index, s.checksum.clone()));

        let members = config.cluster_members();
        let node = RaftNode::restore(
            config.node_id.clone(),
            members.clone(),
            config.raft.clone(),
            term,
            voted_for.clone(),
            snapshot,
            entries,
        );
        info!(
            node_id = %node.id,
            term,
            last_index = node.last_log_index(),
            commit_index = node.commit_index,
            members = members.len(),
            "node state restored"
        );

        let start = now();
        let mut membership = MembershipView::new(config.node_id.clone(), config.member_lease(), start);
        membership.sync(&members, start);

        Ok(Self {
            ledger: VoteLedger::new(config.fact_quorum),
            locks: LockTable::new(),
            membership,
            node,
            storage,
            transport,
            outbox: FactOutbox::new(),
            persisted_hard_state: (term, voted_for),
            persisted_snapshot,
            last_retransfer: None,
            commands,
            inbox,
            shutdown,
            config,
        })
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = tokio::time::Instant::now();
        info!(node_id = %self.node.id, "node actor started");

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(envelope) = self.inbox.recv() => self.handle_envelope(envelope).await,
                tick = ticker.tick() => {
                    let elapsed = tick.saturating_duration_since(last_tick);
                    last_tick = tick;
                    self.on_tick(elapsed.as_millis() as u64).await;
                }
            }
        }

        if let Err(err) = self.persist() {
            error!(node_id = %self.node.id, %err, "final flush failed");
        }
        if !self.outbox.is_empty() {
            warn!(node_id = %self.node.id, pending = self.outbox.len(), "stopping with undelivered facts");
        }
        info!(node_id = %self.node.id, term = self.node.current_term, "node actor stopped");
    }

    async fn on_tick(&mut self, elapsed_ms: u64) {
        let mut outbound = self.node.tick(elapsed_ms);
        let now = now();
        self.sweep(now);
        outbound.extend(self.retransfer_due(now));
        match self.settle().await {
            Ok(()) => self.send_all(outbound).await,
            Err(err) => {
                error!(node_id = %self.node.id, %err, dropped = outbound.len(), "flush failed, outbound messages dropped");
            }
        }
    }

    /// Lease and timeout housekeeping
    fn sweep(&mut self, now: Instant) {
        self.locks.expire_leases(now, self.config.lock_lease());
        for fact_id in self.ledger.abandon_stale(now, self.config.proposal_timeout()) {
            warn!(node_id = %self.node.id, %fact_id, "proposal abandoned after timeout");
        }
        self.membership.refresh(now);
    }

    /// Bring everything derived from the node state up to date: route
    /// undelivered facts, flush to storage, apply and compact.
    ///
    /// Nothing produced here is sent unless the flush succeeded; the caller
    /// must hold back its own replies on error too.
    async fn settle(&mut self) -> std::result::Result<(), StorageError> {
        let outbound = self.route_facts(now());
        self.persist()?;
        if self.config.apply_on_commit {
            self.node.get_entries_to_apply();
        }
        if self.node.should_snapshot() {
            self.node.snapshot_state();
            self.persist()?;
        }
        self.send_all(outbound).await;
        Ok(())
    }

    /// Write term/vote, snapshot and log entries storage has not confirmed.
    ///
    /// The node only learns an entry is durable after the write returned.
    fn persist(&mut self) -> std::result::Result<(), StorageError> {
        let hard_state = (self.node.current_term, self.node.voted_for.clone());
        if hard_state != self.persisted_hard_state {
            self.storage
                .save_term_and_vote(hard_state.0, hard_state.1.as_deref())?;
            self.persisted_hard_state = hard_state;
        }

        if let Some(snapshot) = &self.node.snapshot {
            let marker = (snapshot.last_included_index, snapshot.checksum.clone());
            if self.persisted_snapshot.as_ref() != Some(&marker) {
                self.storage.save_snapshot(snapshot)?;
                self.storage.compact_log_through(marker.0)?;
                // an installed snapshot may have replaced the whole log
                self.storage.truncate_log_from(self.node.log.last_index() + 1)?;
                self.persisted_snapshot = Some(marker);
            }
        }

        if let Some((from, entries)) = self.node.unpersisted() {
            self.storage.truncate_log_from(from)?;
            self.storage.append_entries(&entries)?;
            let through = entries.last().map_or(from - 1, |e| e.index);
            self.node.mark_persisted(through);
            debug!(node_id = %self.node.id, from, count = entries.len(), "log persisted");
        }
        Ok(())
    }

    async fn send(&self, to: NodeId, message: RaftMessage) {
        let envelope = Envelope::new(self.node.id.clone(), to, message);
        if let Err(err) = self.transport.send(envelope).await {
            debug!(node_id = %self.node.id, %err, "send failed");
        }
    }

    async fn send_all(&self, outbound: Vec<(NodeId, RaftMessage)>) {
        for (to, message) in outbound {
            self.send(to, message).await;
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let Envelope { from, message, .. } = envelope;
        debug!(node_id = %self.node.id, %from, kind = message.kind(), term = message.term(), "received");
        self.membership.record_heartbeat(&from, now());

        let mut outbound = Vec::new();
        let reply = match message {
            RaftMessage::VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => Some(
                self.node
                    .handle_vote_request(term, &candidate_id, last_log_index, last_log_term)
                    .0,
            ),
            RaftMessage::VoteResponse { term, vote_granted } => {
                if self.node.handle_vote_response(term, vote_granted, &from) {
                    outbound = self.node.replicate_to_all();
                }
                None
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => Some(
                self.node
                    .handle_append_entries(
                        term,
                        &leader_id,
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit,
                    )
                    .0,
            ),
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
            } => {
                self.node
                    .handle_append_entries_response(term, success, &from, match_index);
                None
            }
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                snapshot,
            } => Some(self.node.handle_install_snapshot(term, &leader_id, snapshot).0),
            RaftMessage::InstallSnapshotResponse {
                term,
                success,
                retransfer,
                last_included_index,
            } => {
                self.node.handle_install_snapshot_response(
                    term,
                    success,
                    retransfer,
                    &from,
                    last_included_index,
                );
                None
            }
            RaftMessage::ForwardProposal { term, payload } => {
                let index = match self.node.handle_forward_proposal(term, payload.clone()) {
                    Ok(index) => {
                        debug!(node_id = %self.node.id, %from, index, "forwarded fact recorded");
                        Some(index)
                    }
                    Err(err) => {
                        debug!(node_id = %self.node.id, %from, %err, "cannot accept forwarded fact");
                        None
                    }
                };
                Some(RaftMessage::ForwardProposalResponse {
                    term: self.node.current_term,
                    payload,
                    index,
                })
            }
            RaftMessage::ForwardProposalResponse {
                term,
                payload,
                index,
            } => {
                self.node.observe_term(term);
                match (index, parse_id(&payload)) {
                    (Some(index), Ok(fact_id)) => {
                        self.outbox.accept(&fact_id, term, index);
                    }
                    (None, _) => {
                        debug!(node_id = %self.node.id, %from, fact = %payload, "leader refused forwarded fact, will resend");
                    }
                    (Some(_), Err(err)) => {
                        warn!(node_id = %self.node.id, %from, %err, "forward acknowledgement for an unknown fact");
                    }
                }
                None
            }
        };

        // durable before answering
        if let Err(err) = self.settle().await {
            error!(node_id = %self.node.id, %from, %err, "flush failed, withholding reply");
            return;
        }
        self.send_all(outbound).await;
        if let Some(reply) = reply {
            self.send(from, reply).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AcquireLock {
                narrative_id,
                node_id,
                reply,
            } => {
                let granted = self.locks.acquire(narrative_id, &node_id, now());
                let _ = reply.send(Ok(granted));
            }
            Command::ReleaseLock {
                narrative_id,
                reply,
            } => {
                self.locks.release(&narrative_id);
                let _ = reply.send(Ok(()));
            }
            Command::ProposeFact {
                fact_id,
                voter,
                reply,
            } => {
                if self.node.fact_committed(&fact_id.to_string()) {
                    debug!(node_id = %self.node.id, %fact_id, "fact already in the replicated log");
                    let _ = reply.send(Ok(true));
                    return;
                }
                let now = now();
                let outcome = match &voter {
                    Some(voter) => self.ledger.propose_with_voter(fact_id, voter, now),
                    None => self.ledger.propose(fact_id, now),
                };
                if outcome.crossed_quorum() {
                    self.outbox.park(fact_id);
                    if let Err(err) = self.settle().await {
                        error!(node_id = %self.node.id, %fact_id, %err, "flush failed, fact stays queued");
                    }
                }
                let _ = reply.send(Ok(outcome.is_committed()));
            }
            Command::Heartbeat { leader_id, reply } => {
                self.membership.record_heartbeat(&leader_id, now());
                self.node.handle_heartbeat(&leader_id);
                let _ = reply.send(Ok(()));
            }
            Command::StartElection { reply } => {
                let outbound = self.node.campaign();
                let result = match self.settle().await {
                    Ok(()) => {
                        self.send_all(outbound).await;
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                };
                let _ = reply.send(result);
            }
            Command::AppendEntries {
                leader_id,
                term,
                entry,
                reply,
            } => {
                let (response, _) = self.node.accept_entry(term, &leader_id, entry);
                let outcome = match response {
                    RaftMessage::AppendEntriesResponse { term, success, .. } => {
                        AppendOutcome { success, term }
                    }
                    _ => AppendOutcome {
                        success: false,
                        term: self.node.current_term,
                    },
                };
                if outcome.success {
                    self.membership.record_heartbeat(&leader_id, now());
                }
                // an entry is only acknowledged once storage holds it
                let result = self.settle().await.map(|()| outcome).map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::RequestVote {
                candidate_id,
                term,
                last_log_index,
                last_log_term,
                reply,
            } => {
                let (response, _) = self.node.handle_vote_request(
                    term,
                    &candidate_id,
                    last_log_index,
                    last_log_term,
                );
                let outcome = match response {
                    RaftMessage::VoteResponse { term, vote_granted } => VoteOutcome {
                        granted: vote_granted,
                        term,
                    },
                    _ => VoteOutcome {
                        granted: false,
                        term: self.node.current_term,
                    },
                };
                // the vote must be durable before it is reported
                let result = self.persist().map(|()| outcome).map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::CommitLog { index, reply } => {
                let applied = self.node.commit_log(index);
                let _ = reply.send(Ok(applied));
            }
            Command::SnapshotState { reply } => {
                let snapshot = self.node.snapshot_state();
                let result = self.persist().map(|()| snapshot).map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::SyncMembership { nodes, reply } => {
                let change = self.membership.sync(&nodes, now());
                if !change.is_empty() {
                    self.node.set_members(self.membership.members());
                }
                let _ = reply.send(Ok(()));
            }
            Command::CheckLease { node_id, reply } => {
                let valid = self.membership.check_lease(&node_id, now());
                let _ = reply.send(Ok(valid));
            }
            Command::VerifyChecksum { checksum, reply } => {
                let verified = match self.node.verify_checksum(&checksum) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(node_id = %self.node.id, %err, alert = err.is_operator_alert(), "requesting full state transfer");
                        match self.retransfer_due(now()) {
                            Some((leader, request)) => self.send(leader, request).await,
                            None => warn!(node_id = %self.node.id, "no leader to resync from yet"),
                        }
                        false
                    }
                };
                let _ = reply.send(Ok(verified));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.node.status()));
            }
        }
    }

    /// Settle undelivered facts: drop the ones the log committed, then
    /// forward the due ones to the leader, or append them when this node leads.
    fn route_facts(&mut self, now: Instant) -> Vec<(NodeId, RaftMessage)> {
        let node = &self.node;
        let delivered = self
            .outbox
            .take_delivered(|fact_id| node.fact_committed(&fact_id.to_string()));
        for fact_id in delivered {
            self.ledger.forget_committed(&fact_id);
            info!(node_id = %self.node.id, %fact_id, "fact committed to the replicated log");
        }

        let term = self.node.current_term;
        let mut outbound = Vec::new();
        let mut appended = false;
        for fact_id in self.outbox.due(now, self.config.resend_interval(), term) {
            match self.node.forward_target() {
                Ok(None) => match self.node.handle_forward_proposal(term, fact_id.to_string()) {
                    Ok(index) => {
                        self.outbox.accept(&fact_id, term, index);
                        appended = true;
                    }
                    Err(err) => {
                        warn!(node_id = %self.node.id, %fact_id, %err, "leader could not append fact");
                        break;
                    }
                },
                Ok(Some(leader)) => {
                    debug!(node_id = %self.node.id, %leader, %fact_id, "forwarding fact to leader");
                    outbound.push((
                        leader,
                        RaftMessage::ForwardProposal {
                            term,
                            payload: fact_id.to_string(),
                        },
                    ));
                    self.outbox.mark_sent(&fact_id, now);
                }
                Err(_) => {
                    debug!(node_id = %self.node.id, pending = self.outbox.len(), "no leader known, facts stay queued");
                    break;
                }
            }
        }
        if appended {
            outbound.extend(self.node.replicate_to_all());
        }
        outbound
    }

    /// Retransfer request for the leader while the ledger is diverged, at
    /// most once per resend interval
    fn retransfer_due(&mut self, now: Instant) -> Option<(NodeId, RaftMessage)> {
        if !self.node.diverged {
            self.last_retransfer = None;
            return None;
        }
        if let Some(at) = self.last_retransfer {
            if now.saturating_duration_since(at) < self.config.resend_interval() {
                return None;
            }
        }
        let request = self.node.retransfer_request()?;
        self.last_retransfer = Some(now);
        Some(request)
    }
}
