use std::time::Duration;

use mix_cryptops::CryptoError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    // ── Build ─────────────────────────────────────────────────────────────

    #[error("graph {graph}: no modules")]
    NoModules { graph: String },

    #[error("graph {graph}: first module not set")]
    NoFirstModule { graph: String },

    #[error("graph {graph}: last module not set")]
    NoLastModule { graph: String },

    #[error("graph {graph}: module id {id} does not belong to this graph")]
    UnknownModule { graph: String, id: usize },

    #[error("graph {graph}: malformed chain: {reason}")]
    MalformedChain { graph: String, reason: String },

    #[error("graph {graph}: module {module} input size {size} is incompatible with slot size {min}")]
    InvalidGranularity {
        graph: String,
        module: String,
        size: u32,
        min: u32,
    },

    #[error("graph {graph}: module {module} has zero threads")]
    ZeroThreads { graph: String, module: String },

    #[error("graph {graph}: batch size must be > 0")]
    ZeroBatch { graph: String },

    #[error("graph {graph}: expanded batch for {batch_size} overflows")]
    BatchTooLarge { graph: String, batch_size: u32 },

    #[error("invalid generator setting: {0}")]
    InvalidGenerator(String),

    // ── Lifecycle ─────────────────────────────────────────────────────────

    #[error("graph {graph} already built")]
    AlreadyBuilt { graph: String },

    #[error("graph {graph} not built")]
    NotBuilt { graph: String },

    #[error("graph {graph} already linked")]
    AlreadyLinked { graph: String },

    #[error("graph {graph} not linked")]
    NotLinked { graph: String },

    #[error("graph {graph} already running")]
    AlreadyRunning { graph: String },

    // ── Ingress / execution ───────────────────────────────────────────────

    #[error("graph {graph}: chunk {begin}..{end} outside of batch {batch_size}")]
    ChunkOutOfBatch {
        graph: String,
        begin: u32,
        end: u32,
        batch_size: u32,
    },

    #[error("graph {graph}: {len} more slots would exceed batch {batch_size}")]
    BatchOverflow {
        graph: String,
        len: u32,
        batch_size: u32,
    },

    #[error("module {module}: index {index} delivered more than once")]
    DuplicateDelivery { module: String, index: u32 },

    #[error("module {module}: index {index} beyond the expanded batch")]
    BeyondBatch { module: String, index: u32 },

    #[error("module {module}: queue closed")]
    QueueClosed { module: String },

    #[error("graph {graph}: workers did not stop within {timeout:?}")]
    KillTimeout { graph: String, timeout: Duration },

    #[error(transparent)]
    Worker(#[from] GraphFailure),
}

/// First worker failure observed in a graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("module {module} in graph {graph} failed: {reason}")]
pub struct GraphFailure {
    pub graph: String,
    pub module: String,
    pub reason: String,
}

/// Error returned by a module adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("{0}")]
    Other(String),
}

/// Per-slot errors reported by stream ingress and egress. These never abort
/// the batch on their own; the caller decides.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("index {index} outside of batch of {len}")]
    OutsideOfBatch { index: u32, len: u32 },

    #[error("slot {index}: value outside of group")]
    OutsideOfGroup { index: u32 },

    #[error("stream not linked")]
    NotLinked,

    #[error("link failed: {0}")]
    Link(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
