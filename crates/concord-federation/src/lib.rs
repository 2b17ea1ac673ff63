//! # concord-federation
//!
//! why: run the consensus core as a live node other services can call
//! relations: drives concord-core, persists with concord-storage
//! what: ConsensusManager facade over a per-node actor, transport, configuration,
//! telemetry and the narrative sync service

mod actor;
pub mod config;
pub mod error;
pub mod manager;
pub mod service;
pub mod telemetry;
pub mod transport;

pub use actor::{AppendOutcome, VoteOutcome};
pub use config::FederationConfig;
pub use error::{FederationError, Result};
pub use manager::ConsensusManager;
pub use service::{FederationService, SyncOutcome};
pub use transport::{Inbox, LocalNetwork, Transport};
