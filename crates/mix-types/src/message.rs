// Protocol messages exchanged between nodes of a round.
//
// The encoding is owned by the transport layer (mix-round::transport); these
// types only fix the shape.

use serde::{Deserialize, Serialize};

use crate::node::{NodeId, RoundId};
use crate::phase::{PhaseTag, PhaseType};

// ── Slot ─────────────────────────────────────────────────────────────────────

/// One batch position as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub payload: u64,
}

impl Slot {
    pub fn new(payload: u64) -> Self {
        Self { payload }
    }
}

// ── Round Error Report ───────────────────────────────────────────────────────

/// Round-level failure as broadcast to peers and persisted for postmortem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundErrorReport {
    pub round_id: RoundId,
    pub node_id: NodeId,
    pub phase: Option<PhaseType>,
    pub error: String,
    /// RFC 3339.
    pub timestamp: String,
}

// ── Round Message ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundMessage {
    /// Create the round on every node of the topology and begin precomputation.
    StartRound {
        round_id: RoundId,
        batch_size: u32,
        topology: Vec<NodeId>,
    },

    /// A contiguous run of slots produced by `tag` on node `from`.
    PostPhase {
        round_id: RoundId,
        tag: PhaseTag,
        from: NodeId,
        begin: u32,
        slots: Vec<Slot>,
    },

    /// Client payloads for the realtime half of a round, sent to the first node.
    PostNewBatch {
        round_id: RoundId,
        slots: Vec<Slot>,
    },

    RoundError(RoundErrorReport),
}

impl RoundMessage {
    pub fn round_id(&self) -> RoundId {
        match self {
            Self::StartRound { round_id, .. }
            | Self::PostPhase { round_id, .. }
            | Self::PostNewBatch { round_id, .. } => *round_id,
            Self::RoundError(report) => report.round_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartRound { .. }   => "StartRound",
            Self::PostPhase { .. }    => "PostPhase",
            Self::PostNewBatch { .. } => "PostNewBatch",
            Self::RoundError(_)       => "RoundError",
        }
    }
}
