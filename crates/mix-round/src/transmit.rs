use std::sync::Arc;

use async_trait::async_trait;

use mix_engine::ChunkReceiver;
use mix_types::PhaseType;

use crate::error::Result;
use crate::round::Round;

/// Drains a phase's egress and forwards results to wherever they go next.
///
/// Returning `Ok` means every notification was consumed; the phase may then
/// finish (or await verification). An error fails the round.
#[async_trait]
pub trait TransmissionHandler: Send + Sync {
    async fn transmit(
        &self,
        round: Arc<Round>,
        phase: PhaseType,
        chunks: ChunkReceiver,
    ) -> Result<()>;
}

/// Supplies the transmission handler for each phase of a new round.
pub trait HandlerFactory: Send + Sync {
    fn handler(&self, phase: PhaseType) -> Arc<dyn TransmissionHandler>;
}

/// Consumes the egress and drops it. Useful for phases whose output stays
/// local.
pub struct DiscardHandler;

#[async_trait]
impl TransmissionHandler for DiscardHandler {
    async fn transmit(
        &self,
        _round: Arc<Round>,
        _phase: PhaseType,
        chunks: ChunkReceiver,
    ) -> Result<()> {
        while chunks.recv().await.is_ok() {}
        Ok(())
    }
}
