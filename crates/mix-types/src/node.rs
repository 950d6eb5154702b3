use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MixError, Result};

pub type RoundId = u64;

// ── Node Id ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Topology ─────────────────────────────────────────────────────────────────

/// Ordered, immutable list of the nodes taking part in one round.
///
/// Batches travel first → last; the node after the last is the first again,
/// which is how permutation phases pick up where decryption left off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    nodes: Vec<NodeId>,
}

impl Topology {
    pub fn new(nodes: Vec<NodeId>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(MixError::Topology("topology has no nodes".into()));
        }
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn get(&self, index: usize) -> Option<&NodeId> {
        self.nodes.get(index)
    }

    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n == id)
    }

    /// How many times `id` appears. A valid round topology holds each node once.
    pub fn occurrences(&self, id: &NodeId) -> usize {
        self.nodes.iter().filter(|n| *n == id).count()
    }

    pub fn first(&self) -> &NodeId {
        &self.nodes[0]
    }

    pub fn last(&self) -> &NodeId {
        &self.nodes[self.nodes.len() - 1]
    }

    pub fn is_first(&self, id: &NodeId) -> bool {
        self.first() == id
    }

    pub fn is_last(&self, id: &NodeId) -> bool {
        self.last() == id
    }

    /// Next node in the ring; the last node wraps to the first.
    pub fn next(&self, id: &NodeId) -> Option<&NodeId> {
        let i = self.index_of(id)?;
        self.nodes.get((i + 1) % self.nodes.len())
    }

    /// Previous node in the ring; the first node wraps to the last.
    pub fn prev(&self, id: &NodeId) -> Option<&NodeId> {
        let i = self.index_of(id)?;
        let n = self.nodes.len();
        self.nodes.get((i + n - 1) % n)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }
}
