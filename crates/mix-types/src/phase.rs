// Phase identifiers and lifecycle states, shared by the round sequencer
// and the wire messages that drive it.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Phase Type ───────────────────────────────────────────────────────────────

/// Every phase a round runs, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PhaseType {
    PrecompGeneration,
    PrecompShare,
    PrecompDecrypt,
    PrecompPermute,
    PrecompEncrypt,
    PrecompReveal,
    RealDecrypt,
    RealPermute,
    RealEncrypt,
}

impl PhaseType {
    pub const ALL: [PhaseType; 9] = [
        Self::PrecompGeneration,
        Self::PrecompShare,
        Self::PrecompDecrypt,
        Self::PrecompPermute,
        Self::PrecompEncrypt,
        Self::PrecompReveal,
        Self::RealDecrypt,
        Self::RealPermute,
        Self::RealEncrypt,
    ];

    /// Last phase of the precomputation half.
    pub const LAST_PRECOMPUTATION: PhaseType = Self::PrecompReveal;

    pub fn is_precomputation(&self) -> bool {
        !matches!(self, Self::RealDecrypt | Self::RealPermute | Self::RealEncrypt)
    }

    /// Phases whose graph carries a single slot regardless of the round batch.
    pub fn is_single_slot(&self) -> bool {
        matches!(self, Self::PrecompShare)
    }

    /// Batch size the phase's graph is built with.
    pub fn graph_batch_size(&self, round_batch_size: u32) -> u32 {
        if self.is_single_slot() {
            1
        } else {
            round_batch_size
        }
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrecompGeneration => write!(f, "PrecompGeneration"),
            Self::PrecompShare      => write!(f, "PrecompShare"),
            Self::PrecompDecrypt    => write!(f, "PrecompDecrypt"),
            Self::PrecompPermute    => write!(f, "PrecompPermute"),
            Self::PrecompEncrypt    => write!(f, "PrecompEncrypt"),
            Self::PrecompReveal     => write!(f, "PrecompReveal"),
            Self::RealDecrypt       => write!(f, "RealDecrypt"),
            Self::RealPermute       => write!(f, "RealPermute"),
            Self::RealEncrypt       => write!(f, "RealEncrypt"),
        }
    }
}

// ── Phase State ──────────────────────────────────────────────────────────────

/// Initialized → Available → Queued → Running → Finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum PhaseState {
    /// Graph and stream allocated, not yet eligible to run.
    Initialized = 0,
    /// The round reached this phase; no input has arrived.
    Available = 1,
    /// Input arrived and the phase was handed to the resource queue.
    Queued = 2,
    /// Workers are executing the graph.
    Running = 3,
    /// All output was handed to the transmission handler.
    Finished = 4,
}

impl PhaseState {
    /// States in which a phase still accepts protocol messages.
    pub const ACTIVE: [PhaseState; 3] = [Self::Available, Self::Queued, Self::Running];

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Initialized),
            1 => Some(Self::Available),
            2 => Some(Self::Queued),
            3 => Some(Self::Running),
            4 => Some(Self::Finished),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// The only state this one may move to, if any.
    pub fn successor(self) -> Option<Self> {
        Self::from_u32(self.as_u32() + 1)
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "Initialized"),
            Self::Available   => write!(f, "Available"),
            Self::Queued      => write!(f, "Queued"),
            Self::Running     => write!(f, "Running"),
            Self::Finished    => write!(f, "Finished"),
        }
    }
}

// ── Phase Tag ────────────────────────────────────────────────────────────────

/// Source phase carried by a protocol message. Verification tags confirm a
/// result another node already computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhaseTag {
    pub phase: PhaseType,
    pub verification: bool,
}

impl PhaseTag {
    pub fn new(phase: PhaseType) -> Self {
        Self { phase, verification: false }
    }

    pub fn verification(phase: PhaseType) -> Self {
        Self { phase, verification: true }
    }
}

impl fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.verification {
            write!(f, "{}Verification", self.phase)
        } else {
            write!(f, "{}", self.phase)
        }
    }
}
