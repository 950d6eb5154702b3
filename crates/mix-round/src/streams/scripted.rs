// Test-only stream whose behaviour is picked by the slot fed at index 0.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use mix_engine::{
    AdapterError, Chunk, Graph, GraphGenerator, InputSize, ModuleTemplate, NumThreads, Stream,
    StreamError,
};
use mix_types::Slot;

use super::{LinkSource, PhaseGraph};

pub const PASS: u64 = 1;
pub const FAIL: u64 = 2;
pub const HANG: u64 = 3;

/// Set to let hung workers return.
pub static RELEASE: AtomicBool = AtomicBool::new(false);

pub struct ScriptedStream {
    mode: AtomicU64,
    len: u32,
}

impl Stream for ScriptedStream {
    type Source = LinkSource;

    const NAME: &'static str = "Scripted";

    fn link(batch_size: u32, _source: LinkSource) -> Result<Self, StreamError> {
        Ok(Self {
            mode: AtomicU64::new(PASS),
            len: batch_size,
        })
    }

    fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError> {
        if index == 0 {
            self.mode.store(slot.payload, Ordering::Release);
        }
        Ok(())
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        if index >= self.len {
            return Err(StreamError::OutsideOfBatch { index, len: self.len });
        }
        Ok(Slot::new(1))
    }
}

fn run_script(s: &ScriptedStream, _chunk: Chunk) -> Result<(), AdapterError> {
    match s.mode.load(Ordering::Acquire) {
        FAIL => Err(AdapterError::Other("scripted failure".into())),
        HANG => {
            while !RELEASE.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

const SCRIPT: ModuleTemplate<ScriptedStream> = ModuleTemplate {
    name: "Scripted",
    adapter: run_script,
    input_size: InputSize::Auto,
    num_threads: NumThreads::Fixed(1),
    start_threshold: 0.0,
};

pub fn graph(gen: &GraphGenerator) -> PhaseGraph {
    let mut g: Graph<ScriptedStream> = gen.new_graph(ScriptedStream::NAME);
    let m = g.add_module(&SCRIPT);
    g.first(m);
    g.last(m);
    PhaseGraph::Scripted(g)
}
