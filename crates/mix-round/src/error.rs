use std::time::Duration;

use mix_cryptops::CryptoError;
use mix_engine::{EngineError, LinkError, StreamError};
use mix_types::{Activity, MixError, PhaseState, PhaseType, RoundId};

#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    // ── Protocol violations ───────────────────────────────────────────────

    #[error("phase {phase}: invalid state transition: {from} → {to}")]
    InvalidTransition {
        phase: PhaseType,
        from: PhaseState,
        to: PhaseState,
    },

    #[error("no response registered for {tag}")]
    MissingResponse { tag: String },

    #[error("{tag}: phase {phase} is {state}, expected one of {expected:?}")]
    UnexpectedState {
        tag: String,
        phase: PhaseType,
        state: PhaseState,
        expected: Vec<PhaseState>,
    },

    #[error("round {round_id} has no phase {phase}")]
    UnknownPhase { round_id: RoundId, phase: PhaseType },

    #[error("phase {phase} finished out of order (current is {current})")]
    OutOfOrder { phase: PhaseType, current: PhaseType },

    #[error("phase {0} does not take verification")]
    NoVerification(PhaseType),

    #[error("timed out waiting for {tag} to become acceptable")]
    GateTimeout { tag: String },

    // ── Round lifecycle ───────────────────────────────────────────────────

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("invalid round: {0}")]
    InvalidRound(String),

    #[error("round {0} already exists or was already used")]
    DuplicateRound(RoundId),

    #[error("unknown round {0}")]
    UnknownRound(RoundId),

    #[error("phase {phase} timed out after {after:?}")]
    Timeout { phase: PhaseType, after: Duration },

    #[error("transmission failed: {0}")]
    Transmission(String),

    // ── Node level ────────────────────────────────────────────────────────

    #[error("resource queue halted")]
    QueueHalted,

    #[error("illegal activity transition: {from} → {to}")]
    InvalidActivity { from: Activity, to: Activity },

    #[error("node is {current}, expected one of {expected:?}")]
    UnexpectedActivity {
        current: Activity,
        expected: Vec<Activity>,
    },

    #[error("node fatal: {0}")]
    NodeFatal(String),

    // ── Wrapped ───────────────────────────────────────────────────────────

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("slot rejected: {0}")]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Types(#[from] MixError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RoundError {
    /// Conditions after which the node can no longer trust its compute state.
    pub fn is_node_fatal(&self) -> bool {
        matches!(
            self,
            Self::NodeFatal(_) | Self::Engine(EngineError::KillTimeout { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, RoundError>;
