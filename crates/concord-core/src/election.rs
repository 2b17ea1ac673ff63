//! # election
//!
//! why: elect at most one leader per term through randomized timeouts and majority votes
//! relations: extends RaftNode (node.rs); the leader side continues in replication.rs
//! what: election timer tick, start_election, RequestVote handling, split-vote accounting

use tracing::{debug, error, info, warn};

use crate::error::ConsensusError;
use crate::{NodeId, NodeState, RaftMessage, RaftNode, Term};

impl RaftNode {
    /// Advance the node's timers by `elapsed_ms`.
    ///
    /// Followers and candidates start a new election once their randomized
    /// timeout expires; a leader emits AppendEntries (heartbeats or pending
    /// entries) to every peer once per heartbeat interval. Returns the
    /// messages to send, addressed by peer.
    pub fn tick(&mut self, elapsed_ms: u64) -> Vec<(NodeId, RaftMessage)> {
        match self.state {
            NodeState::Leader => {
                self.heartbeat_elapsed += elapsed_ms;
                if self.heartbeat_elapsed < self.config.heartbeat_interval {
                    return Vec::new();
                }
                self.heartbeat_elapsed = 0;
                self.replicate_to_all()
            }
            NodeState::Follower | NodeState::Candidate => {
                self.election_elapsed += elapsed_ms;
                if self.election_elapsed < self.randomized_election_timeout {
                    return Vec::new();
                }
                if self.state == NodeState::Candidate {
                    self.record_split_vote();
                }
                self.campaign()
            }
        }
    }

    /// Start an election and address the vote request to every peer.
    ///
    /// A single-member cluster wins immediately and gets its first
    /// heartbeat round instead.
    pub fn campaign(&mut self) -> Vec<(NodeId, RaftMessage)> {
        let request = self.start_election();
        if self.is_leader() {
            return self.replicate_to_all();
        }
        self.peers().map(|peer| (peer.clone(), request.clone())).collect()
    }

    /// Become a candidate for the next term and vote for ourselves
    pub fn start_election(&mut self) -> RaftMessage {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id.clone());
        self.leader_id = None;
        self.votes_received = vec![self.id.clone()];
        self.reset_election_timer();

        info!(
            node_id = %self.id,
            term = self.current_term,
            timeout_ms = self.randomized_election_timeout,
            "election timeout, starting election"
        );

        let request = RaftMessage::VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        if self.has_quorum() {
            self.become_leader();
        }
        request
    }

    /// Handle a RequestVote RPC.
    ///
    /// Returns the response and whether the election timer was reset (it is
    /// only reset when the vote is granted).
    pub fn handle_vote_request(
        &mut self,
        term: Term,
        candidate_id: &str,
        last_log_index: u64,
        last_log_term: Term,
    ) -> (RaftMessage, bool) {
        if let Err(err) = self.check_term(term) {
            debug!(node_id = %self.id, candidate = candidate_id, term, %err, "rejecting vote");
            return (self.vote_response(false), false);
        }
        if term > self.current_term {
            self.become_follower(term);
        }

        let free_to_vote = match &self.voted_for {
            None => true,
            Some(voted) => voted == candidate_id,
        };
        // a candidate's log must be at least as up to date as ours:
        // later last term wins, equal terms compare length
        let log_ok = last_log_term > self.last_log_term()
            || (last_log_term == self.last_log_term() && last_log_index >= self.last_log_index());

        if free_to_vote && log_ok {
            self.voted_for = Some(candidate_id.to_string());
            self.reset_election_timer();
            debug!(node_id = %self.id, candidate = candidate_id, term, "vote granted");
            return (self.vote_response(true), true);
        }

        debug!(
            node_id = %self.id,
            candidate = candidate_id,
            term,
            already_voted = ?self.voted_for,
            log_ok,
            "vote denied"
        );
        (self.vote_response(false), false)
    }

    /// Handle a vote response; returns true if this made us leader
    pub fn handle_vote_response(&mut self, term: Term, vote_granted: bool, from: &str) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if self.state != NodeState::Candidate || term < self.current_term {
            return false;
        }

        if vote_granted && !self.votes_received.iter().any(|v| v == from) {
            self.votes_received.push(from.to_string());
        }

        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    /// Liveness alert once too many elections in a row produced no leader
    pub fn liveness_warning(&self) -> Option<ConsensusError> {
        if self.failed_elections >= self.config.max_split_vote_retries {
            Some(ConsensusError::SplitVoteLivenessWarning {
                attempts: self.failed_elections,
            })
        } else {
            None
        }
    }

    fn record_split_vote(&mut self) {
        self.failed_elections += 1;
        if self.failed_elections >= self.config.max_split_vote_retries {
            error!(
                node_id = %self.id,
                term = self.current_term,
                attempts = self.failed_elections,
                "repeated split votes, cluster has no leader"
            );
        } else {
            warn!(
                node_id = %self.id,
                term = self.current_term,
                votes = self.votes_received.len(),
                needed = self.quorum_size(),
                "split vote, re-randomizing election timeout"
            );
        }
    }

    fn vote_response(&self, vote_granted: bool) -> RaftMessage {
        RaftMessage::VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }
}
