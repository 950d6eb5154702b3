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

/// Accumulates `K^-r` into the running precomputation product.
pub struct PrecompDecryptStream {
    grp: CyclicGroup,
    buffer: Arc<RoundBuffer>,
    keys: IntBuffer,
}

impl Stream for PrecompDecryptStream {
    type Source = LinkSource;

    const NAME: &'static str = "PrecompDecrypt";

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

fn precomp_decrypt_mul(s: &PrecompDecryptStream, chunk: Chunk) -> Result<(), AdapterError> {
    for i in chunk.indices() {
        let inverse = folded_inverse(&s.grp, &s.buffer, &s.buffer.r_exp, i)?;
        s.keys.set(i, ops::mul2(&s.grp, s.keys.get(i), inverse)?);
    }
    Ok(())
}

pub const PRECOMP_DECRYPT_MUL: ModuleTemplate<PrecompDecryptStream> = ModuleTemplate {
    name: "DecryptMul",
    adapter: precomp_decrypt_mul,
    input_size: InputSize::Auto,
    num_threads: NumThreads::Auto,
    start_threshold: 0.0,
};

pub fn precomp_graph(gen: &GraphGenerator) -> PhaseGraph {
    let mut g: Graph<PrecompDecryptStream> = gen.new_graph(PrecompDecryptStream::NAME);
    let mul = g.add_module(&PRECOMP_DECRYPT_MUL);
    g.first(mul);
    g.last(mul);
    PhaseGraph::PrecompDecrypt(g)
}

// ── Realtime ─────────────────────────────────────────────────────────────────

/// Blinds each client message with `r`.
pub struct RealDecryptStream {
    grp: CyclicGroup,
    buffer: Arc<RoundBuffer>,
    messages: IntBuffer,
}

impl Stream for RealDecryptStream {
    type Source = LinkSource;

    const NAME: &'static str = "RealDecrypt";

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

fn real_decrypt_mul(s: &RealDecryptStream, chunk: Chunk) -> Result<(), AdapterError> {
    for i in chunk.indices() {
        s.messages.set(i, ops::mul2(&s.grp, s.messages.get(i), s.buffer.r.get(i))?);
    }
    Ok(())
}

pub const REAL_DECRYPT_MUL: ModuleTemplate<RealDecryptStream> = ModuleTemplate {
    name: "DecryptMul",
    adapter: real_decrypt_mul,
    input_size: InputSize::Auto,
    num_threads: NumThreads::Auto,
    start_threshold: 0.0,
};

pub fn realtime_graph(gen: &GraphGenerator) -> PhaseGraph {
    let mut g: Graph<RealDecryptStream> = gen.new_graph(RealDecryptStream::NAME);
    let mul = g.add_module(&REAL_DECRYPT_MUL);
    g.first(mul);
    g.last(mul);
    PhaseGraph::RealDecrypt(g)
}

#[cfg(test)]
mod tests {
    use super::*;

    const Z: u64 = 17;

    fn source() -> LinkSource {
        let grp = CyclicGroup::new((1u64 << 61) - 1, 37).unwrap();
        let buffer = Arc::new(RoundBuffer::new(3, 4));
        for i in 0..4 {
            buffer.r_exp.set(i, 5);
            buffer.r.set(i, grp.exp(grp.generator(), 5));
        }
        buffer.set_cypher_public_key(grp.exp(grp.generator(), Z));
        LinkSource { grp, buffer }
    }

    #[test]
    fn realtime_blinds_and_revealed_precomp_unblinds() {
        let src = source();
        let real = RealDecryptStream::link(4, src.clone()).unwrap();
        let pre = PrecompDecryptStream::link(4, src.clone()).unwrap();

        real.input(1, &Slot::new(11)).unwrap();
        real_decrypt_mul(&real, Chunk::new(0, 4)).unwrap();
        precomp_decrypt_mul(&pre, Chunk::new(0, 4)).unwrap();

        let blinded = real.output(1).unwrap().payload;
        assert_eq!(blinded, src.grp.mul(11, src.buffer.r.get(1)));
        let encrypted = pre.output(1).unwrap().payload;
        assert_ne!(src.grp.mul(blinded, encrypted), 11);
        let revealed = ops::root_coprime(&src.grp, encrypted, Z).unwrap();
        assert_eq!(src.grp.mul(blinded, revealed), 11);
    }

    #[test]
    fn precomp_needs_the_public_key() {
        let src = source();
        src.buffer.set_cypher_public_key(0);
        let pre = PrecompDecryptStream::link(4, src).unwrap();
        assert!(precomp_decrypt_mul(&pre, Chunk::new(0, 4)).is_err());
    }

    #[test]
    fn padding_is_not_addressable_from_the_wire() {
        let real = RealDecryptStream::link(4, source()).unwrap();
        assert!(matches!(
            real.input(3, &Slot::new(2)),
            Err(StreamError::OutsideOfBatch { index: 3, len: 3 })
        ));
        assert!(real.output(3).is_err());
    }
}
