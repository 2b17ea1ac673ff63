//! # config
//!
//! why: one place for every tunable of a federation node
//! relations: consumed by ConsensusManager::start and the binary
//! what: FederationConfig with serde defaults, TOML loading, validation

use std::path::{Path, PathBuf};
use std::time::Duration;

use concord_core::{NodeId, RaftConfig};
use serde::{Deserialize, Serialize};

use crate::error::{FederationError, Result};

/// Node configuration.
///
/// ```toml
/// node_id = "node-a"
/// members = ["node-a", "node-b", "node-c"]
/// fact_quorum = 3
/// data_dir = "/var/lib/concord/node-a"
///
/// [raft]
/// election_timeout_min = 150
/// election_timeout_max = 300
/// heartbeat_interval = 50
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub node_id: NodeId,
    /// Initial voting membership; empty means a single-node cluster
    pub members: Vec<NodeId>,
    /// Votes a fact needs before it is committed. Fixed, not derived from membership.
    pub fact_quorum: usize,
    pub lock_lease_ms: u64,
    pub member_lease_ms: u64,
    pub proposal_timeout_ms: u64,
    pub tick_ms: u64,
    /// Apply committed entries to the narrative ledger on every tick
    pub apply_on_commit: bool,
    /// Persist to files here; in memory when unset
    pub data_dir: Option<PathBuf>,
    pub raft: RaftConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            node_id: "node-primary".to_string(),
            members: Vec::new(),
            fact_quorum: 3,
            lock_lease_ms: 30_000,
            member_lease_ms: 3_000,
            proposal_timeout_ms: 60_000,
            tick_ms: 10,
            apply_on_commit: true,
            data_dir: None,
            raft: RaftConfig::default(),
        }
    }
}

impl FederationConfig {
    /// Defaults for `node_id` in a cluster of `members`
    pub fn for_node(node_id: impl Into<NodeId>, members: Vec<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            members,
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| FederationError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(FederationError::InvalidConfig(msg.to_string()));
        if self.node_id.is_empty() {
            return invalid("node_id must not be empty");
        }
        if self.fact_quorum == 0 {
            return invalid("fact_quorum must be at least 1");
        }
        if self.tick_ms == 0 {
            return invalid("tick_ms must be positive");
        }
        if self.raft.election_timeout_min > self.raft.election_timeout_max {
            return invalid("raft.election_timeout_min exceeds raft.election_timeout_max");
        }
        if self.raft.heartbeat_interval >= self.raft.election_timeout_min {
            return invalid("raft.heartbeat_interval must be shorter than raft.election_timeout_min");
        }
        Ok(())
    }

    /// Voting members including this node
    pub fn cluster_members(&self) -> Vec<NodeId> {
        let mut members = self.members.clone();
        if !members.contains(&self.node_id) {
            members.push(self.node_id.clone());
        }
        members
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn member_lease(&self) -> Duration {
        Duration::from_millis(self.member_lease_ms)
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// How long an unanswered forward or retransfer request waits before it
    /// is sent again: one minimum election timeout
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.raft.election_timeout_min)
    }
}
