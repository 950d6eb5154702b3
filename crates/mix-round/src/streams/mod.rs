//! Concrete phase streams and the closed set of graphs a round can run.
//!
//! Every stream links against the same [`LinkSource`]: the round's group and
//! its shared [`RoundBuffer`]. The realtime streams only read key material the
//! precomputation streams wrote.
//!
//! ```text
//!   precomputation  Generate ─ Share ─ Decrypt ─ Permute ─ Encrypt ─ Reveal
//!                                      K^-r      K^-s      K^-t      root z
//!   realtime                           Decrypt ─ Permute ─ Encrypt [─ Identify]
//!                                      ·r        ·s        ·t         ·precomputation
//! ```

pub mod decrypt;
pub mod encrypt;
pub mod generate;
pub mod permute;
pub mod reveal;
pub mod share;

#[cfg(test)]
pub(crate) mod scripted;

use std::sync::Arc;
use std::time::Duration;

use mix_cryptops::{ops, CryptoError, CyclicGroup, IntBuffer};
use mix_engine::{Chunk, ChunkReceiver, EngineError, Graph, GraphFailure, LinkError, Stream, StreamError};
use mix_types::Slot;

use crate::buffer::RoundBuffer;

use self::decrypt::{PrecompDecryptStream, RealDecryptStream};
use self::encrypt::{IdentifyStream, PrecompEncryptStream, RealEncryptStream};
use self::generate::GenerateStream;
use self::permute::{PrecompPermuteStream, RealPermuteStream};
use self::reveal::PrecompRevealStream;
use self::share::ShareStream;

/// What every phase stream binds to.
#[derive(Debug, Clone)]
pub struct LinkSource {
    pub grp: CyclicGroup,
    pub buffer: Arc<RoundBuffer>,
}

// ── Phase graph ──────────────────────────────────────────────────────────────

/// A built graph over one of the known phase streams.
pub enum PhaseGraph {
    Generate(Graph<GenerateStream>),
    Share(Graph<ShareStream>),
    PrecompDecrypt(Graph<PrecompDecryptStream>),
    PrecompPermute(Graph<PrecompPermuteStream>),
    PrecompEncrypt(Graph<PrecompEncryptStream>),
    PrecompReveal(Graph<PrecompRevealStream>),
    RealDecrypt(Graph<RealDecryptStream>),
    RealPermute(Graph<RealPermuteStream>),
    RealEncrypt(Graph<RealEncryptStream>),
    RealIdentify(Graph<IdentifyStream>),
    #[cfg(test)]
    Scripted(Graph<scripted::ScriptedStream>),
}

macro_rules! dispatch {
    ($graph:expr, $g:ident => $body:expr) => {
        match $graph {
            PhaseGraph::Generate($g) => $body,
            PhaseGraph::Share($g) => $body,
            PhaseGraph::PrecompDecrypt($g) => $body,
            PhaseGraph::PrecompPermute($g) => $body,
            PhaseGraph::PrecompEncrypt($g) => $body,
            PhaseGraph::PrecompReveal($g) => $body,
            PhaseGraph::RealDecrypt($g) => $body,
            PhaseGraph::RealPermute($g) => $body,
            PhaseGraph::RealEncrypt($g) => $body,
            PhaseGraph::RealIdentify($g) => $body,
            #[cfg(test)]
            PhaseGraph::Scripted($g) => $body,
        }
    };
}

fn stream_name<S: Stream>(_: &Graph<S>) -> &'static str {
    S::NAME
}

impl PhaseGraph {
    pub fn name(&self) -> &str {
        dispatch!(self, g => g.name())
    }

    pub fn stream_name(&self) -> &'static str {
        dispatch!(self, g => stream_name(g))
    }

    pub fn build(&mut self, batch_size: u32) -> Result<(), EngineError> {
        dispatch!(self, g => g.build(batch_size))
    }

    pub fn link(&mut self, source: LinkSource) -> Result<(), LinkError> {
        dispatch!(self, g => g.link(source))
    }

    pub fn run(&self) -> Result<(), EngineError> {
        dispatch!(self, g => g.run())
    }

    pub fn send(&self, chunk: Chunk) -> Result<(), EngineError> {
        dispatch!(self, g => g.send(chunk))
    }

    pub fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError> {
        dispatch!(self, g => g.input(index, slot))
    }

    pub fn output(&self, index: u32) -> Result<Slot, StreamError> {
        dispatch!(self, g => g.output(index))
    }

    pub fn chunk_done(&self) -> Result<ChunkReceiver, EngineError> {
        dispatch!(self, g => g.chunk_done())
    }

    pub async fn failed(&self) -> GraphFailure {
        dispatch!(self, g => g.failed().await)
    }

    pub async fn kill(&self, timeout: Duration) -> Result<(), EngineError> {
        dispatch!(self, g => g.kill(timeout).await)
    }

    pub fn batch_size(&self) -> u32 {
        dispatch!(self, g => g.batch_size())
    }

    pub fn expanded_batch_size(&self) -> u32 {
        dispatch!(self, g => g.expanded_batch_size())
    }

    pub fn is_killed(&self) -> bool {
        dispatch!(self, g => g.is_killed())
    }
}

// ── Shared stream helpers ────────────────────────────────────────────────────

/// Round buffers must cover the graph's expanded batch.
fn check_capacity(name: &str, buffer: &RoundBuffer, expanded: u32) -> Result<(), StreamError> {
    if buffer.capacity() < expanded {
        return Err(StreamError::Link(format!(
            "{name}: round buffer holds {} slots, graph needs {expanded}",
            buffer.capacity()
        )));
    }
    Ok(())
}

/// Store a wire slot at `index` of `target`, accepting only positions of the
/// real batch and values inside the group.
fn store_slot(
    grp: &CyclicGroup,
    target: &IntBuffer,
    batch_size: u32,
    index: u32,
    slot: &Slot,
) -> Result<(), StreamError> {
    if index >= batch_size {
        return Err(StreamError::OutsideOfBatch { index, len: batch_size });
    }
    if !grp.inside(slot.payload) {
        return Err(StreamError::OutsideOfGroup { index });
    }
    target.set(index as usize, slot.payload);
    Ok(())
}

/// `K^-e` for the exponent at `index`: the inverse of that key, encrypted
/// under the round's cypher public key.
fn folded_inverse(
    grp: &CyclicGroup,
    buffer: &RoundBuffer,
    exponents: &IntBuffer,
    index: usize,
) -> Result<u64, CryptoError> {
    let e = grp.negate_exponent(exponents.get(index));
    ops::exp(grp, buffer.cypher_public_key(), e)
}

fn load_slot(source: &IntBuffer, batch_size: u32, index: u32) -> Result<Slot, StreamError> {
    if index >= batch_size {
        return Err(StreamError::OutsideOfBatch { index, len: batch_size });
    }
    Ok(Slot::new(source.get(index as usize)))
}
