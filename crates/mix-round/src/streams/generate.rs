use std::sync::Arc;

use mix_cryptops::{ops, CyclicGroup};
use mix_engine::{
    AdapterError, Chunk, Graph, GraphGenerator, InputSize, ModuleTemplate, NumThreads, Stream,
    StreamError,
};
use mix_types::Slot;

use super::{check_capacity, LinkSource, PhaseGraph};
use crate::buffer::RoundBuffer;

/// Fills the round buffer with fresh per-slot keys, the permutation and the
/// share exponent. Takes no wire input.
pub struct GenerateStream {
    grp: CyclicGroup,
    buffer: Arc<RoundBuffer>,
}

impl Stream for GenerateStream {
    type Source = LinkSource;

    const NAME: &'static str = "PrecompGeneration";

    fn link(batch_size: u32, source: LinkSource) -> Result<Self, StreamError> {
        check_capacity(Self::NAME, &source.buffer, batch_size)?;
        Ok(Self {
            grp: source.grp,
            buffer: source.buffer,
        })
    }

    fn input(&self, index: u32, _slot: &Slot) -> Result<(), StreamError> {
        let len = self.buffer.batch_size();
        if index >= len {
            return Err(StreamError::OutsideOfBatch { index, len });
        }
        Ok(())
    }

    /// Generation publishes nothing; every position reads as the identity.
    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        let len = self.buffer.batch_size();
        if index >= len {
            return Err(StreamError::OutsideOfBatch { index, len });
        }
        Ok(Slot::new(1))
    }
}

fn generate_keys(s: &GenerateStream, chunk: Chunk) -> Result<(), AdapterError> {
    let mut rng = rand::thread_rng();
    let b = &s.buffer;
    for i in chunk.indices() {
        for (keys, exponents) in [(&b.r, &b.r_exp), (&b.s, &b.s_exp), (&b.t, &b.t_exp)] {
            let (key, e) = ops::generate(&s.grp, &mut rng);
            keys.set(i, key);
            exponents.set(i, e);
        }
    }
    Ok(())
}

// Padding positions keep the identity permutation.
fn generate_round_secrets(s: &GenerateStream, _chunk: Chunk) -> Result<(), AdapterError> {
    let mut rng = rand::thread_rng();
    let b = &s.buffer;
    for (i, dest) in ops::shuffle(&mut rng, b.batch_size()).into_iter().enumerate() {
        b.permutation.set(i, u64::from(dest));
    }
    b.set_z(s.grp.random_coprime_exponent(&mut rng));
    Ok(())
}

pub const GENERATE: ModuleTemplate<GenerateStream> = ModuleTemplate {
    name: "Generate",
    adapter: generate_keys,
    input_size: InputSize::Auto,
    num_threads: NumThreads::Auto,
    start_threshold: 0.0,
};

pub const GENERATE_SECRETS: ModuleTemplate<GenerateStream> = ModuleTemplate {
    name: "GenerateSecrets",
    adapter: generate_round_secrets,
    input_size: InputSize::Batch,
    num_threads: NumThreads::Fixed(1),
    start_threshold: 0.0,
};

/// `Generate → GenerateSecrets`
pub fn graph(gen: &GraphGenerator) -> PhaseGraph {
    let mut g: Graph<GenerateStream> = gen.new_graph(GenerateStream::NAME);
    let keys = g.add_module(&GENERATE);
    let secrets = g.add_module(&GENERATE_SECRETS);
    g.first(keys);
    g.connect(keys, secrets);
    g.last(secrets);
    PhaseGraph::Generate(g)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(batch: u32, capacity: u32) -> LinkSource {
        LinkSource {
            grp: CyclicGroup::new((1u64 << 61) - 1, 37).unwrap(),
            buffer: Arc::new(RoundBuffer::new(batch, capacity)),
        }
    }

    #[test]
    fn keys_match_their_exponents() {
        let src = source(6, 8);
        let s = GenerateStream::link(8, src.clone()).unwrap();
        generate_keys(&s, Chunk::new(0, 8)).unwrap();
        generate_round_secrets(&s, Chunk::new(0, 8)).unwrap();

        let b = &src.buffer;
        let g = src.grp.generator();
        for i in 0..8 {
            assert_eq!(src.grp.exp(g, b.r_exp.get(i)), b.r.get(i));
            assert_eq!(src.grp.exp(g, b.s_exp.get(i)), b.s.get(i));
            assert_eq!(src.grp.exp(g, b.t_exp.get(i)), b.t.get(i));
        }
        let mut perm: Vec<u64> = b.permutation.to_vec()[..6].to_vec();
        perm.sort_unstable();
        assert_eq!(perm, (0..6).collect::<Vec<u64>>());
        assert_eq!(b.permuted(6), 6);
        assert_eq!(b.permuted(7), 7);
        assert!(src.grp.invert_exponent(b.z()).is_some());
    }

    #[test]
    fn link_rejects_small_buffer() {
        assert!(matches!(
            GenerateStream::link(8, source(6, 4)),
            Err(StreamError::Link(_))
        ));
    }
}
