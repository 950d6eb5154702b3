use std::sync::Arc;

use mix_cryptops::{ops, CyclicGroup, IntBuffer};
use mix_engine::{
    AdapterError, Chunk, Graph, GraphGenerator, InputSize, ModuleTemplate, NumThreads, Stream,
    StreamError,
};
use mix_types::Slot;

use super::{check_capacity, folded_inverse, load_slot, store_slot, LinkSource, PhaseGraph};
use crate::buffer::RoundBuffer;

// ── Precomputation ───────────────────────────────────────────────────────────

/// Folds `K^-t` into the permuted precomputation product. Every permutation
/// already ran, so `t` is indexed by the slot a message leaves in.
pub struct PrecompEncryptStream {
    grp: CyclicGroup,
    buffer: Arc<RoundBuffer>,
    keys: IntBuffer,
}

impl Stream for PrecompEncryptStream {
    type Source = LinkSource;

    const NAME: &'static str = "PrecompEncrypt";

    fn link(batch_size: u32, source: LinkSource) -> Result<Self, StreamError> {
        check_capacity(Self::NAME, &source.buffer, batch_size)?;
        Ok(Self {
            grp: source.grp,
            buffer: source.buffer,
            keys: IntBuffer::new(batch_size as usize, 1),
        })
    }

    fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError> {
        store_slot(&self.grp, &self.keys, self.buffer.batch_size(), index, slot)
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        load_slot(&self.keys, self.buffer.batch_size(), index)
    }
}

fn precomp_encrypt_mul(s: &PrecompEncryptStream, chunk: Chunk) -> Result<(), AdapterError> {
    for k in chunk.indices() {
        let inverse = folded_inverse(&s.grp, &s.buffer, &s.buffer.t_exp, k)?;
        s.keys.set(k, ops::mul2(&s.grp, s.keys.get(k), inverse)?);
    }
    Ok(())
}

pub const PRECOMP_ENCRYPT_MUL: ModuleTemplate<PrecompEncryptStream> = ModuleTemplate {
    name: "EncryptMul",
    adapter: precomp_encrypt_mul,
    input_size: InputSize::Auto,
    num_threads: NumThreads::Auto,
    start_threshold: 0.0,
};

pub fn precomp_graph(gen: &GraphGenerator) -> PhaseGraph {
    let mut g: Graph<PrecompEncryptStream> = gen.new_graph(PrecompEncryptStream::NAME);
    let mul = g.add_module(&PRECOMP_ENCRYPT_MUL);
    g.first(mul);
    g.last(mul);
    PhaseGraph::PrecompEncrypt(g)
}

// ── Realtime ─────────────────────────────────────────────────────────────────

/// Multiplies each permuted message by this node's `t`.
pub struct RealEncryptStream {
    grp: CyclicGroup,
    buffer: Arc<RoundBuffer>,
    messages: IntBuffer,
}

impl Stream for RealEncryptStream {
    type Source = LinkSource;

    const NAME: &'static str = "RealEncrypt";

    fn link(batch_size: u32, source: LinkSource) -> Result<Self, StreamError> {
        check_capacity(Self::NAME, &source.buffer, batch_size)?;
        Ok(Self {
            grp: source.grp,
            buffer: source.buffer,
            messages: IntBuffer::new(batch_size as usize, 1),
        })
    }

    fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError> {
        store_slot(&self.grp, &self.messages, self.buffer.batch_size(), index, slot)
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        load_slot(&self.messages, self.buffer.batch_size(), index)
    }
}

fn real_encrypt_mul(s: &RealEncryptStream, chunk: Chunk) -> Result<(), AdapterError> {
    for k in chunk.indices() {
        s.messages.set(k, ops::mul2(&s.grp, s.messages.get(k), s.buffer.t.get(k))?);
    }
    Ok(())
}

pub const REAL_ENCRYPT_MUL: ModuleTemplate<RealEncryptStream> = ModuleTemplate {
    name: "EncryptMul",
    adapter: real_encrypt_mul,
    input_size: InputSize::Auto,
    num_threads: NumThreads::Auto,
    start_threshold: 0.0,
};

pub fn realtime_graph(gen: &GraphGenerator) -> PhaseGraph {
    let mut g: Graph<RealEncryptStream> = gen.new_graph(RealEncryptStream::NAME);
    let mul = g.add_module(&REAL_ENCRYPT_MUL);
    g.first(mul);
    g.last(mul);
    PhaseGraph::RealEncrypt(g)
}

// ── Identify ─────────────────────────────────────────────────────────────────

/// Realtime encrypt on the last node. Once its own key is in, multiplying by
/// the revealed precomputation cancels every node's keys and leaves the
/// client payloads.
pub struct IdentifyStream {
    inner: RealEncryptStream,
}

impl Stream for IdentifyStream {
    type Source = LinkSource;

    const NAME: &'static str = "RealIdentify";

    fn link(batch_size: u32, source: LinkSource) -> Result<Self, StreamError> {
        check_capacity(Self::NAME, &source.buffer, batch_size)?;
        Ok(Self {
            inner: RealEncryptStream::link(batch_size, source)?,
        })
    }

    fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError> {
        self.inner.input(index, slot)
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        self.inner.output(index)
    }
}

fn identify_encrypt_mul(s: &IdentifyStream, chunk: Chunk) -> Result<(), AdapterError> {
    real_encrypt_mul(&s.inner, chunk)
}

fn identify(s: &IdentifyStream, chunk: Chunk) -> Result<(), AdapterError> {
    let e = &s.inner;
    for k in chunk.indices() {
        let value = ops::mul2(&e.grp, e.messages.get(k), e.buffer.precomputation.get(k))?;
        e.messages.set(k, value);
    }
    Ok(())
}

pub const IDENTIFY_ENCRYPT_MUL: ModuleTemplate<IdentifyStream> = ModuleTemplate {
    name: "EncryptMul",
    adapter: identify_encrypt_mul,
    input_size: InputSize::Auto,
    num_threads: NumThreads::Auto,
    start_threshold: 0.0,
};

/// Holds until the whole batch is encrypted.
pub const IDENTIFY: ModuleTemplate<IdentifyStream> = ModuleTemplate {
    name: "Identify",
    adapter: identify,
    input_size: InputSize::Auto,
    num_threads: NumThreads::Auto,
    start_threshold: 1.0,
};

/// `EncryptMul → Identify`
pub fn identify_graph(gen: &GraphGenerator) -> PhaseGraph {
    let mut g: Graph<IdentifyStream> = gen.new_graph(IdentifyStream::NAME);
    let mul = g.add_module(&IDENTIFY_ENCRYPT_MUL);
    let ident = g.add_module(&IDENTIFY);
    g.first(mul);
    g.connect(mul, ident);
    g.last(ident);
    PhaseGraph::RealIdentify(g)
}
