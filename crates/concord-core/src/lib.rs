//! # concord-core
//!
//! why: decide, across cooperating nodes, whether a narrative fact may be committed
//! relations: driven by concord-federation's node actor, persisted via concord-storage
//! what: election and replication state machine, log store, vote ledger, narrative
//! locks, membership leases, snapshots and conflict resolution
//!
//! Nothing in this crate performs IO or reads a clock. Time enters as
//! `Instant` arguments or elapsed milliseconds, so every protocol rule can be
//! exercised deterministically.

pub mod conflict;
pub mod delivery;
pub mod election;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod log;
pub mod membership;
pub mod message;
pub mod node;
pub mod replication;
pub mod state;

pub use conflict::resolve_conflict;
pub use delivery::{FactOutbox, PendingFact};
pub use error::ConsensusError;
pub use ledger::{FactProposal, ProposalOutcome, VoteLedger};
pub use lock::{LockTable, NarrativeLock};
pub use log::{Log, LogEntry};
pub use membership::{MembershipChange, MembershipEntry, MembershipView};
pub use message::{Envelope, RaftMessage};
pub use node::{NodeState, NodeStatus, RaftConfig, RaftNode};
pub use state::{AppliedState, Snapshot};

/// Election epoch.
pub type Term = u64;

/// Opaque node identifier.
pub type NodeId = String;

/// Narrative identifier (canonical UUID).
pub type NarrativeId = uuid::Uuid;

/// Fact identifier (canonical UUID).
pub type FactId = uuid::Uuid;
