use std::sync::Arc;

use mix_cryptops::{ops, CyclicGroup, IntBuffer};
use mix_engine::{
    AdapterError, Chunk, EngineError, Graph, GraphGenerator, InputSize, ModuleTemplate, NumThreads,
    Stream, StreamError,
};
use mix_types::Slot;

use super::{check_capacity, folded_inverse, load_slot, store_slot, LinkSource, PhaseGraph};
use crate::buffer::RoundBuffer;

// ── Shared sub-stream ────────────────────────────────────────────────────────

/// Which form of the permute key a permutation multiplies in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermuteKey {
    /// `s`, for client payloads.
    Plain,
    /// `K^-s`, for the precomputation.
    Folded,
}

/// State shared by every permuting stream: inbound values, the permuted
/// result and the round's key material.
///
/// `values[i]` moves to `permuted[π(i)]` after being multiplied by the key at
/// its destination.
pub struct PermuteSubStream {
    grp: CyclicGroup,
    buffer: Arc<RoundBuffer>,
    key: PermuteKey,
    values: IntBuffer,
    permuted: IntBuffer,
}

impl PermuteSubStream {
    fn link(name: &str, expanded: u32, source: LinkSource, key: PermuteKey) -> Result<Self, StreamError> {
        check_capacity(name, &source.buffer, expanded)?;
        Ok(Self {
            grp: source.grp,
            buffer: source.buffer,
            key,
            values: IntBuffer::new(expanded as usize, 1),
            permuted: IntBuffer::new(expanded as usize, 1),
        })
    }

    fn key(&self, dest: usize) -> Result<u64, AdapterError> {
        match self.key {
            PermuteKey::Plain => Ok(self.buffer.s.get(dest)),
            PermuteKey::Folded => {
                Ok(folded_inverse(&self.grp, &self.buffer, &self.buffer.s_exp, dest)?)
            }
        }
    }

    pub fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError> {
        store_slot(&self.grp, &self.values, self.buffer.batch_size(), index, slot)
    }

    pub fn output(&self, index: u32) -> Result<Slot, StreamError> {
        load_slot(&self.permuted, self.buffer.batch_size(), index)
    }
}

/// Streams that embed a [`PermuteSubStream`] share the permutation adapters.
pub trait PermuteAccess {
    fn permute_sub(&self) -> &PermuteSubStream;
}

fn permute_mul<S: PermuteAccess>(s: &S, chunk: Chunk) -> Result<(), AdapterError> {
    let p = s.permute_sub();
    for i in chunk.indices() {
        let dest = p.buffer.permuted(i);
        p.values.set(i, ops::mul2(&p.grp, p.values.get(i), p.key(dest)?)?);
    }
    Ok(())
}

fn permute<S: PermuteAccess>(s: &S, chunk: Chunk) -> Result<(), AdapterError> {
    let p = s.permute_sub();
    for i in chunk.indices() {
        p.permuted.set(p.buffer.permuted(i), p.values.get(i));
    }
    Ok(())
}

fn permute_mul_module<S: PermuteAccess>() -> ModuleTemplate<S> {
    ModuleTemplate {
        name: "PermuteMul",
        adapter: permute_mul::<S>,
        input_size: InputSize::Auto,
        num_threads: NumThreads::Auto,
        start_threshold: 0.0,
    }
}

fn permute_module<S: PermuteAccess>() -> ModuleTemplate<S> {
    ModuleTemplate {
        name: "Permute",
        adapter: permute::<S>,
        input_size: InputSize::Auto,
        num_threads: NumThreads::Auto,
        start_threshold: 0.0,
    }
}

// ── Concrete streams ─────────────────────────────────────────────────────────

macro_rules! permute_stream {
    ($(#[$doc:meta])* $name:ident, $tag:literal, $key:expr) => {
        $(#[$doc])*
        pub struct $name {
            sub: PermuteSubStream,
        }

        impl PermuteAccess for $name {
            fn permute_sub(&self) -> &PermuteSubStream {
                &self.sub
            }
        }

        impl Stream for $name {
            type Source = LinkSource;

            const NAME: &'static str = $tag;

            fn link(batch_size: u32, source: LinkSource) -> Result<Self, StreamError> {
                Ok(Self {
                    sub: PermuteSubStream::link(Self::NAME, batch_size, source, $key)?,
                })
            }

            fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError> {
                self.sub.input(index, slot)
            }

            fn output(&self, index: u32) -> Result<Slot, StreamError> {
                self.sub.output(index)
            }
        }
    };
}

permute_stream!(
    /// Permutes the precomputation product, folding in `K^-s`.
    PrecompPermuteStream,
    "PrecompPermute",
    PermuteKey::Folded
);

permute_stream!(
    /// Permutes blinded messages, folding in `s`.
    RealPermuteStream,
    "RealPermute",
    PermuteKey::Plain
);

// ── Graphs ───────────────────────────────────────────────────────────────────

// Permuted positions are only final once every input was permuted, so these
// graphs hold all egress until the batch completes.
fn permuting<S: PermuteAccess + Stream>(gen: &GraphGenerator) -> Result<Graph<S>, EngineError> {
    let mut g = gen.with_output_threshold(1.0)?.new_graph(S::NAME);
    let mul = g.add_module(&permute_mul_module::<S>());
    let perm = g.add_module(&permute_module::<S>());
    g.first(mul);
    g.connect(mul, perm);
    g.last(perm);
    Ok(g)
}

/// `PermuteMul → Permute`
pub fn precomp_graph(gen: &GraphGenerator) -> Result<PhaseGraph, EngineError> {
    Ok(PhaseGraph::PrecompPermute(permuting(gen)?))
}

/// `PermuteMul → Permute`
pub fn realtime_graph(gen: &GraphGenerator) -> Result<PhaseGraph, EngineError> {
    Ok(PhaseGraph::RealPermute(permuting(gen)?))
}
