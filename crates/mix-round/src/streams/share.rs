use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mix_cryptops::{ops, CyclicGroup};
use mix_engine::{
    AdapterError, Chunk, Graph, GraphGenerator, InputSize, ModuleTemplate, NumThreads, Stream,
    StreamError,
};
use mix_types::Slot;

use super::{check_capacity, LinkSource, PhaseGraph};
use crate::buffer::RoundBuffer;

/// Raises the running partial public key to this node's exponent `z`.
/// Carries a single slot.
pub struct ShareStream {
    grp: CyclicGroup,
    buffer: Arc<RoundBuffer>,
    partial: AtomicU64,
}

impl ShareStream {
    fn check_index(index: u32) -> Result<(), StreamError> {
        if index != 0 {
            return Err(StreamError::OutsideOfBatch { index, len: 1 });
        }
        Ok(())
    }
}

impl Stream for ShareStream {
    type Source = LinkSource;

    const NAME: &'static str = "PrecompShare";

    fn link(batch_size: u32, source: LinkSource) -> Result<Self, StreamError> {
        check_capacity(Self::NAME, &source.buffer, batch_size)?;
        let start = source.grp.generator();
        Ok(Self {
            grp: source.grp,
            buffer: source.buffer,
            partial: AtomicU64::new(start),
        })
    }

    fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError> {
        Self::check_index(index)?;
        if !self.grp.inside(slot.payload) {
            return Err(StreamError::OutsideOfGroup { index });
        }
        self.partial.store(slot.payload, Ordering::Release);
        Ok(())
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        Self::check_index(index)?;
        Ok(Slot::new(self.partial.load(Ordering::Acquire)))
    }
}

fn share_exp(s: &ShareStream, chunk: Chunk) -> Result<(), AdapterError> {
    if chunk.begin() == 0 {
        let raised = ops::exp(&s.grp, s.partial.load(Ordering::Acquire), s.buffer.z())?;
        s.partial.store(raised, Ordering::Release);
    }
    Ok(())
}

pub const SHARE_EXP: ModuleTemplate<ShareStream> = ModuleTemplate {
    name: "ShareExp",
    adapter: share_exp,
    input_size: InputSize::Batch,
    num_threads: NumThreads::Fixed(1),
    start_threshold: 0.0,
};

pub fn graph(gen: &GraphGenerator) -> PhaseGraph {
    let mut g: Graph<ShareStream> = gen.new_graph(ShareStream::NAME);
    let exp = g.add_module(&SHARE_EXP);
    g.first(exp);
    g.last(exp);
    PhaseGraph::Share(g)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raises_partial_key() {
        let grp = CyclicGroup::new((1u64 << 61) - 1, 37).unwrap();
        let buffer = Arc::new(RoundBuffer::new(1, 4));
        buffer.set_z(5);
        let s = ShareStream::link(4, LinkSource { grp, buffer }).unwrap();

        s.input(0, &Slot::new(3)).unwrap();
        share_exp(&s, Chunk::new(0, 4)).unwrap();
        assert_eq!(s.output(0).unwrap(), Slot::new(243));
    }

    #[test]
    fn single_slot_only() {
        let grp = CyclicGroup::new((1u64 << 61) - 1, 37).unwrap();
        let buffer = Arc::new(RoundBuffer::new(1, 4));
        let s = ShareStream::link(4, LinkSource { grp, buffer }).unwrap();
        assert_eq!(s.output(0).unwrap(), Slot::new(37));
        assert!(matches!(
            s.input(1, &Slot::new(3)),
            Err(StreamError::OutsideOfBatch { index: 1, len: 1 })
        ));
        assert!(matches!(
            s.input(0, &Slot::new(0)),
            Err(StreamError::OutsideOfGroup { index: 0 })
        ));
    }
}
