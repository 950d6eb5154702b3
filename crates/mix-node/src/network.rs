//! Node-to-node transport.
//!
//! [`PeerNetwork`] is the only thing a node needs from the network: send an
//! encoded [`RoundMessage`] to a peer by id. [`LocalNetwork`] implements it
//! in memory, one bounded inbox per registered node, for the simulator and
//! tests.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use mix_round::{encode_message, Result, RoundError};
use mix_types::{NodeId, RoundMessage};

/// Inbox buffer per node. Sized to absorb one round's chunk traffic from a
/// few peers without blocking senders.
pub const INBOX_CAPACITY: usize = 1024;

#[async_trait]
pub trait PeerNetwork: Send + Sync {
    async fn send(&self, to: &NodeId, msg: &RoundMessage) -> Result<()>;
}

// ── LocalNetwork ─────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct LocalNetwork {
    peers: Arc<RwLock<HashMap<NodeId, mpsc::Sender<Vec<u8>>>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `id` and return its inbox. Re-registering replaces the old
    /// inbox.
    pub fn register(&self, id: NodeId) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        rx
    }

    pub fn unregister(&self, id: &NodeId) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        nodes
    }
}

#[async_trait]
impl PeerNetwork for LocalNetwork {
    async fn send(&self, to: &NodeId, msg: &RoundMessage) -> Result<()> {
        let data = encode_message(msg)?;
        let tx = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(to)
            .cloned()
            .ok_or_else(|| RoundError::Transmission(format!("unknown peer {to}")))?;
        debug!(%to, kind = msg.kind(), round_id = msg.round_id(), bytes = data.len(), "send");
        tx.send(data)
            .await
            .map_err(|_| RoundError::Transmission(format!("peer {to} inbox closed")))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
