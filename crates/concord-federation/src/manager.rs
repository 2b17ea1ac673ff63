//! # manager
//!
//! why: the public consensus facade external collaborators call into
//! relations: cloneable handle over the node actor (actor.rs); used by FederationService and the binary
//! what: ConsensusManager spawn/start, one async method per facade operation, shutdown

use std::sync::Arc;

use concord_core::{FactId, LogEntry, NarrativeId, NodeId, NodeStatus, Snapshot, Term};
use concord_storage::{FileStorage, InMemoryStorage, Storage};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::actor::{AppendOutcome, Command, ConsensusActor, Reply, VoteOutcome};
use crate::config::FederationConfig;
use crate::error::{FederationError, Result};
use crate::transport::{Inbox, LocalNetwork, Transport};

const COMMAND_BUFFER: usize = 256;

/// Handle to a running node.
///
/// Clones share the same actor. Every call is answered by the actor in the
/// order it was received, so operations on one node never interleave.
#[derive(Clone)]
pub struct ConsensusManager {
    node_id: NodeId,
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConsensusManager {
    /// Start a node on `network`, persisting under `config.data_dir` when set
    pub fn start(config: FederationConfig, network: &LocalNetwork) -> Result<Self> {
        let storage: Box<dyn Storage> = match &config.data_dir {
            Some(dir) => Box::new(FileStorage::new(dir)?),
            None => Box::new(InMemoryStorage::new()),
        };
        let inbox = network.register(config.node_id.clone());
        Self::spawn(config, storage, Arc::new(network.clone()), inbox)
    }

    /// Start a node with explicit storage and transport
    pub fn spawn(
        config: FederationConfig,
        storage: Box<dyn Storage>,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
    ) -> Result<Self> {
        config.validate()?;
        let node_id = config.node_id.clone();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let actor = ConsensusActor::new(config, storage, transport, commands_rx, inbox, shutdown_rx)?;
        let task = tokio::spawn(actor.run());

        Ok(Self {
            node_id,
            commands: commands_tx,
            shutdown: shutdown_tx,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| FederationError::ActorUnavailable)?;
        rx.await.map_err(|_| FederationError::ActorUnavailable)?
    }

    /// Take the narrative lock for `node_id`; false if anyone holds it
    pub async fn acquire_lock(&self, narrative_id: NarrativeId, node_id: &str) -> Result<bool> {
        let node_id = node_id.to_string();
        self.request(|reply| Command::AcquireLock {
            narrative_id,
            node_id,
            reply,
        })
        .await
    }

    /// Release the narrative lock; a no-op when unlocked
    pub async fn release_lock(&self, narrative_id: NarrativeId) -> Result<()> {
        self.request(|reply| Command::ReleaseLock {
            narrative_id,
            reply,
        })
        .await
    }

    /// Cast one vote for `fact_id`.
    ///
    /// True iff this call crossed the quorum, or the fact was committed
    /// before; earlier votes see false.
    pub async fn propose_fact(&self, fact_id: FactId) -> Result<bool> {
        self.request(|reply| Command::ProposeFact {
            fact_id,
            voter: None,
            reply,
        })
        .await
    }

    /// Cast a vote attributed to `voter_id`; repeated votes from one voter are ignored
    pub async fn propose_fact_as(&self, fact_id: FactId, voter_id: &str) -> Result<bool> {
        let voter = Some(voter_id.to_string());
        self.request(|reply| Command::ProposeFact {
            fact_id,
            voter,
            reply,
        })
        .await
    }

    /// Pick the winner between two narrative versions; see [`concord_core::resolve_conflict`]
    pub fn resolve_conflict(&self, version_a: &str, version_b: &str) -> String {
        concord_core::resolve_conflict(version_a, version_b).to_string()
    }

    pub async fn heartbeat(&self, leader_id: &str) -> Result<()> {
        let leader_id = leader_id.to_string();
        self.request(|reply| Command::Heartbeat { leader_id, reply })
            .await
    }

    pub async fn start_election(&self) -> Result<()> {
        self.request(|reply| Command::StartElection { reply }).await
    }

    /// Offer a single entry from `leader_id`.
    ///
    /// Rejected (with this node's term) for stale terms and for entries that
    /// would leave a gap; duplicates are accepted without change.
    pub async fn append_entries(&self, leader_id: &str, term: Term, entry: LogEntry) -> Result<AppendOutcome> {
        let leader_id = leader_id.to_string();
        self.request(|reply| Command::AppendEntries {
            leader_id,
            term,
            entry,
            reply,
        })
        .await
    }

    pub async fn request_vote(
        &self,
        candidate_id: &str,
        term: Term,
        last_log_index: u64,
        last_log_term: Term,
    ) -> Result<VoteOutcome> {
        let candidate_id = candidate_id.to_string();
        self.request(|reply| Command::RequestVote {
            candidate_id,
            term,
            last_log_index,
            last_log_term,
            reply,
        })
        .await
    }

    /// Apply committed entries up to `index`; returns the ones applied by this call
    pub async fn commit_log(&self, index: u64) -> Result<Vec<LogEntry>> {
        self.request(|reply| Command::CommitLog { index, reply }).await
    }

    pub async fn snapshot_state(&self) -> Result<Snapshot> {
        self.request(|reply| Command::SnapshotState { reply }).await
    }

    /// Replace the membership with `nodes`. The fact quorum is left untouched.
    pub async fn sync_membership(&self, nodes: Vec<NodeId>) -> Result<()> {
        self.request(|reply| Command::SyncMembership { nodes, reply })
            .await
    }

    pub async fn check_lease(&self, node_id: &str) -> Result<bool> {
        let node_id = node_id.to_string();
        self.request(|reply| Command::CheckLease { node_id, reply })
            .await
    }

    /// Compare the applied narrative ledger against `checksum`.
    ///
    /// On mismatch the node asks its leader for a fresh snapshot and the
    /// call reports false.
    pub async fn verify_checksum(&self, checksum: &str) -> Result<bool> {
        let checksum = checksum.to_string();
        self.request(|reply| Command::VerifyChecksum { checksum, reply })
            .await
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stop the actor and wait for its final flush. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(node_id = %self.node_id, %err, "node actor terminated abnormally");
                return Err(FederationError::ActorUnavailable);
            }
            info!(node_id = %self.node_id, "node shut down");
        }
        Ok(())
    }
}
