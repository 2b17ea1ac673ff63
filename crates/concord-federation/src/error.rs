//! # error
//!
//! why: one error type for every facade call
//! relations: wraps concord-core and concord-storage errors; returned by ConsensusManager
//! what: FederationError, Result alias

use std::path::PathBuf;

use concord_core::ConsensusError;
use concord_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("reading config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("transport: {0}")]
    Transport(String),

    /// The node actor has stopped; the handle is no longer usable
    #[error("node actor is not running")]
    ActorUnavailable,
}

pub type Result<T> = std::result::Result<T, FederationError>;
