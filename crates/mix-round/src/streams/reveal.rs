use std::sync::Arc;

use mix_cryptops::{ops, CyclicGroup, IntBuffer};
use mix_engine::{
    AdapterError, Chunk, Graph, GraphGenerator, InputSize, ModuleTemplate, NumThreads, Stream,
    StreamError,
};
use mix_types::Slot;

use super::{check_capacity, load_slot, store_slot, LinkSource, PhaseGraph};
use crate::buffer::RoundBuffer;

/// Takes this node's `z`-th root of the encrypted precomputation. The
/// cypher key is `g^(z₁·…·zₙ)`, so once every node has revealed, the
/// product is in the clear.
pub struct PrecompRevealStream {
    grp: CyclicGroup,
    buffer: Arc<RoundBuffer>,
    values: IntBuffer,
}

impl Stream for PrecompRevealStream {
    type Source = LinkSource;

    const NAME: &'static str = "PrecompReveal";

    fn link(batch_size: u32, source: LinkSource) -> Result<Self, StreamError> {
        check_capacity(Self::NAME, &source.buffer, batch_size)?;
        Ok(Self {
            grp: source.grp,
            buffer: source.buffer,
            values: IntBuffer::new(batch_size as usize, 1),
        })
    }

    fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError> {
        store_slot(&self.grp, &self.values, self.buffer.batch_size(), index, slot)
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        load_slot(&self.values, self.buffer.batch_size(), index)
    }
}

fn reveal_root(s: &PrecompRevealStream, chunk: Chunk) -> Result<(), AdapterError> {
    let z = s.buffer.z();
    for k in chunk.indices() {
        s.values.set(k, ops::root_coprime(&s.grp, s.values.get(k), z)?);
    }
    Ok(())
}

pub const REVEAL_ROOT: ModuleTemplate<PrecompRevealStream> = ModuleTemplate {
    name: "RevealRoot",
    adapter: reveal_root,
    input_size: InputSize::Auto,
    num_threads: NumThreads::Auto,
    start_threshold: 0.0,
};

pub fn graph(gen: &GraphGenerator) -> PhaseGraph {
    let mut g: Graph<PrecompRevealStream> = gen.new_graph(PrecompRevealStream::NAME);
    let root = g.add_module(&REVEAL_ROOT);
    g.first(root);
    g.last(root);
    PhaseGraph::PrecompReveal(g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mix_cryptops::CryptoError;

    fn node(z: u64) -> (CyclicGroup, PrecompRevealStream) {
        let grp = CyclicGroup::new((1u64 << 61) - 1, 37).unwrap();
        let buffer = Arc::new(RoundBuffer::new(2, 4));
        buffer.set_z(z);
        let s = PrecompRevealStream::link(4, LinkSource { grp, buffer }).unwrap();
        (grp, s)
    }

    #[test]
    fn every_node_strips_its_share() {
        let (grp, first) = node(17);
        let (_, second) = node(19);
        let hidden = grp.exp(grp.exp(1234, 17), 19);

        first.input(0, &Slot::new(hidden)).unwrap();
        reveal_root(&first, Chunk::new(0, 4)).unwrap();
        let partial = first.output(0).unwrap();
        assert_ne!(partial.payload, 1234);

        second.input(0, &partial).unwrap();
        reveal_root(&second, Chunk::new(0, 4)).unwrap();
        assert_eq!(second.output(0).unwrap().payload, 1234);
    }

    #[test]
    fn missing_secret_fails() {
        let (_, s) = node(0);
        assert!(matches!(
            reveal_root(&s, Chunk::new(0, 4)),
            Err(AdapterError::Crypto(CryptoError::NotInvertible { exponent: 0 }))
        ));
    }
}
