//! # transport
//!
//! why: move raft messages between node actors without the actors knowing how
//! relations: ConsensusActor sends through `Transport`; LocalNetwork backs tests and the binary
//! what: Transport trait, LocalNetwork (in-process mailboxes, JSON on the wire, partitions)

use std::sync::Arc;

use async_trait::async_trait;
use concord_core::{Envelope, NodeId};
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{FederationError, Result};

/// Outbound message delivery.
///
/// Delivery is best effort: a message lost to a partition is not an error,
/// the protocol recovers through retries on the next heartbeat.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<()>;
}

/// In-process network connecting node actors through mailboxes.
///
/// Every message is encoded and decoded on the way, so it crosses the same
/// serialization boundary as a real wire would.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    mailboxes: DashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
    isolated: DashSet<NodeId>,
}

/// Receiving side of a node's mailbox
pub struct Inbox {
    node_id: NodeId,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Inbox {
    /// Next decodable envelope; None once the network is gone
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let frame = self.rx.recv().await?;
            match Envelope::decode(&frame) {
                Ok(envelope) => return Some(envelope),
                Err(err) => debug!(node_id = %self.node_id, %err, "dropping undecodable frame"),
            }
        }
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the mailbox for `node_id`
    pub fn register(&self, node_id: impl Into<NodeId>) -> Inbox {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.mailboxes.insert(node_id.clone(), tx);
        Inbox { node_id, rx }
    }

    pub fn deregister(&self, node_id: &str) {
        self.inner.mailboxes.remove(node_id);
    }

    /// Cut `node_id` off: nothing it sends or is sent gets through
    pub fn partition(&self, node_id: impl Into<NodeId>) {
        self.inner.isolated.insert(node_id.into());
    }

    pub fn heal(&self, node_id: &str) {
        self.inner.isolated.remove(node_id);
    }

    pub fn heal_all(&self) {
        self.inner.isolated.clear();
    }

    pub fn is_partitioned(&self, node_id: &str) -> bool {
        self.inner.isolated.contains(node_id)
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.is_partitioned(&envelope.from) || self.is_partitioned(&envelope.to) {
            debug!(from = %envelope.from, to = %envelope.to, kind = envelope.message.kind(), "dropped by partition");
            return Ok(());
        }
        let frame = envelope
            .encode()
            .map_err(|err| FederationError::Transport(err.to_string()))?;

        let mailbox = self
            .inner
            .mailboxes
            .get(&envelope.to)
            .map(|entry| entry.value().clone());
        match mailbox {
            // the receiver may have shut down; that looks like loss to the sender
            Some(tx) => {
                if tx.send(frame).is_err() {
                    debug!(to = %envelope.to, "mailbox closed, message dropped");
                }
                Ok(())
            }
            None => Err(FederationError::Transport(format!(
                "no route to node {}",
                envelope.to
            ))),
        }
    }
}
