//! Where each phase's output goes once its graph has produced it.
//!
//! ```text
//!   PrecompGeneration  first node: kick own PrecompShare with g
//!   PrecompShare       last node: broadcast verification(PrecompShare, key)
//!   PrecompReveal      last node: keep result as the precomputation
//!   RealEncrypt        last node: emit the CompletedBatch
//!   everything else    PostPhase to the next node of the ring; the last
//!                      node's successor is the first node
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info};

use mix_engine::{Chunk, ChunkReceiver};
use mix_round::{HandlerFactory, Result, Round, RoundError, TransmissionHandler};
use mix_types::{PhaseTag, PhaseType, RoundId, RoundMessage, Slot};

use crate::network::PeerNetwork;

/// Realtime output of a round, in the order the last node produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedBatch {
    pub round_id: RoundId,
    pub slots: Vec<Slot>,
}

// ── Protocol handler ─────────────────────────────────────────────────────────

pub struct ProtocolHandler {
    network: Arc<dyn PeerNetwork>,
    completed: mpsc::UnboundedSender<CompletedBatch>,
}

impl ProtocolHandler {
    pub fn new(
        network: Arc<dyn PeerNetwork>,
        completed: mpsc::UnboundedSender<CompletedBatch>,
    ) -> Self {
        Self { network, completed }
    }

    /// Read every egress notification, clipped to the real batch, as
    /// `(begin, slots)` runs.
    async fn collect(
        round: &Round,
        phase: PhaseType,
        chunks: ChunkReceiver,
    ) -> Result<Vec<(u32, Vec<Slot>)>> {
        let mut runs = Vec::new();
        while let Ok(chunk) = chunks.recv().await {
            if let Some(run) = Self::read_chunk(round, phase, chunk)? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    fn read_chunk(
        round: &Round,
        phase: PhaseType,
        chunk: Chunk,
    ) -> Result<Option<(u32, Vec<Slot>)>> {
        let graph = round.phase(phase)?.graph();
        let end = chunk.end().min(graph.batch_size());
        if chunk.begin() >= end {
            return Ok(None);
        }
        let slots = (chunk.begin()..end)
            .map(|i| graph.output(i))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Some((chunk.begin(), slots)))
    }

    fn post(round: &Round, tag: PhaseTag, begin: u32, slots: Vec<Slot>) -> RoundMessage {
        RoundMessage::PostPhase {
            round_id: round.id(),
            tag,
            from: round.node_id().clone(),
            begin,
            slots,
        }
    }

    async fn forward(&self, round: &Round, phase: PhaseType, chunks: ChunkReceiver) -> Result<()> {
        let next = round.next_node().cloned().ok_or_else(|| {
            RoundError::InvalidTopology(format!("{} has no successor", round.node_id()))
        })?;
        while let Ok(chunk) = chunks.recv().await {
            if let Some((begin, slots)) = Self::read_chunk(round, phase, chunk)? {
                let msg = Self::post(round, PhaseTag::new(phase), begin, slots);
                self.network.send(&next, &msg).await?;
            }
        }
        Ok(())
    }

    async fn generation(&self, round: &Round, chunks: ChunkReceiver) -> Result<()> {
        while chunks.recv().await.is_ok() {}
        if round.is_first_node() {
            let g = Slot::new(round.group().generator());
            let msg = Self::post(round, PhaseTag::new(PhaseType::PrecompGeneration), 0, vec![g]);
            self.network.send(round.node_id(), &msg).await?;
        }
        Ok(())
    }

    async fn broadcast_key(&self, round: &Round, chunks: ChunkReceiver) -> Result<()> {
        let runs = Self::collect(round, PhaseType::PrecompShare, chunks).await?;
        let key = runs
            .into_iter()
            .find(|(begin, _)| *begin == 0)
            .and_then(|(_, slots)| slots.first().copied())
            .ok_or_else(|| RoundError::Transmission("share produced no key".into()))?;
        round.buffer().set_cypher_public_key(key.payload);

        let msg = Self::post(round, PhaseTag::verification(PhaseType::PrecompShare), 0, vec![key]);
        let sends = round.topology().iter().map(|to| self.network.send(to, &msg));
        join_all(sends).await.into_iter().collect::<Result<Vec<_>>>()?;
        info!(round_id = round.id(), key = key.payload, "cypher public key broadcast");
        Ok(())
    }

    async fn store_precomputation(&self, round: &Round, chunks: ChunkReceiver) -> Result<()> {
        let precomputation = &round.buffer().precomputation;
        for (begin, slots) in Self::collect(round, PhaseType::PrecompReveal, chunks).await? {
            for (offset, slot) in slots.iter().enumerate() {
                precomputation.set(begin as usize + offset, slot.payload);
            }
        }
        debug!(round_id = round.id(), "precomputation stored");
        Ok(())
    }

    async fn complete(&self, round: &Round, chunks: ChunkReceiver) -> Result<()> {
        let mut out: Vec<Option<Slot>> = vec![None; round.batch_size() as usize];
        for (begin, slots) in Self::collect(round, PhaseType::RealEncrypt, chunks).await? {
            for (offset, slot) in slots.into_iter().enumerate() {
                out[begin as usize + offset] = Some(slot);
            }
        }
        let slots = out
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.ok_or_else(|| RoundError::Transmission(format!("slot {i} never produced")))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(round_id = round.id(), slots = slots.len(), "realtime batch complete");
        self.completed
            .send(CompletedBatch {
                round_id: round.id(),
                slots,
            })
            .map_err(|_| RoundError::Transmission("completed batch receiver dropped".into()))
    }
}

#[async_trait]
impl TransmissionHandler for ProtocolHandler {
    async fn transmit(
        &self,
        round: Arc<Round>,
        phase: PhaseType,
        chunks: ChunkReceiver,
    ) -> Result<()> {
        let last = round.is_last_node();
        match phase {
            PhaseType::PrecompGeneration => self.generation(&round, chunks).await,
            PhaseType::PrecompShare if last => self.broadcast_key(&round, chunks).await,
            PhaseType::PrecompReveal if last => self.store_precomputation(&round, chunks).await,
            PhaseType::RealEncrypt if last => self.complete(&round, chunks).await,
            _ => self.forward(&round, phase, chunks).await,
        }
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Hands the same [`ProtocolHandler`] to every phase of every round.
#[derive(Clone)]
pub struct HandlerSet {
    handler: Arc<ProtocolHandler>,
}

impl HandlerSet {
    pub fn new(
        network: Arc<dyn PeerNetwork>,
        completed: mpsc::UnboundedSender<CompletedBatch>,
    ) -> Self {
        Self {
            handler: Arc::new(ProtocolHandler::new(network, completed)),
        }
    }
}

impl HandlerFactory for HandlerSet {
    fn handler(&self, _phase: PhaseType) -> Arc<dyn TransmissionHandler> {
        Arc::clone(&self.handler) as Arc<dyn TransmissionHandler>
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
