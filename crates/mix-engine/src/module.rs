// Module templates and their per-graph bound copies.
//
// A `ModuleTemplate` is a plain immutable value describing a unit of work.
// Graphs never run templates; `Graph::add_module` copies the template into a
// fresh `BoundModule` owning its own queue and accounting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_channel::{Receiver, Sender};

use crate::assignment::AssignmentList;
use crate::chunk::Chunk;
use crate::error::{AdapterError, EngineError, Result};

/// Applies one operation over `[chunk.begin, chunk.end)` of a stream.
pub type Adapter<S> = fn(&S, Chunk) -> std::result::Result<(), AdapterError>;

/// Chunk granularity a module asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSize {
    /// The generator's minimum input size.
    Auto,
    Fixed(u32),
    /// One chunk spanning the whole expanded batch.
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumThreads {
    /// The generator's default thread count.
    Auto,
    Fixed(u8),
}

// ── Template ─────────────────────────────────────────────────────────────────

pub struct ModuleTemplate<S> {
    pub name: &'static str,
    pub adapter: Adapter<S>,
    pub input_size: InputSize,
    pub num_threads: NumThreads,
    /// Fraction of this module's input that must be ready before it starts.
    pub start_threshold: f32,
}

// Manual impls: deriving would demand `S: Clone`.
impl<S> Clone for ModuleTemplate<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for ModuleTemplate<S> {}

impl<S> fmt::Debug for ModuleTemplate<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleTemplate")
            .field("name", &self.name)
            .field("input_size", &self.input_size)
            .field("num_threads", &self.num_threads)
            .field("start_threshold", &self.start_threshold)
            .finish()
    }
}

/// Handle to a module inside one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub(crate) usize);

impl ModuleId {
    pub fn index(&self) -> usize {
        self.0
    }
}

// ── Bound copy ───────────────────────────────────────────────────────────────

pub(crate) struct BoundModule<S> {
    pub name: &'static str,
    /// `None` for the synthetic output module, which has no workers.
    pub adapter: Option<Adapter<S>>,
    pub num_threads: u8,
    pub assignments: AssignmentList,
    pub outputs: Vec<ModuleId>,
    pub invocations: AtomicU64,
    tx: Sender<Chunk>,
    rx: Receiver<Chunk>,
}

impl<S> BoundModule<S> {
    pub fn new(
        name: &'static str,
        adapter: Option<Adapter<S>>,
        granularity: u32,
        num_threads: u8,
        threshold: f32,
        expanded: u32,
        outputs: Vec<ModuleId>,
    ) -> Self {
        let assignments = AssignmentList::new(name, expanded, granularity, threshold);
        // Capacity covers every assignment, so producers never wait on workers.
        let (tx, rx) = async_channel::bounded(assignments.total().max(1) as usize);
        Self {
            name,
            adapter,
            num_threads,
            assignments,
            outputs,
            invocations: AtomicU64::new(0),
            tx,
            rx,
        }
    }

    pub fn granularity(&self) -> u32 {
        self.assignments.granularity()
    }

    pub fn receiver(&self) -> Receiver<Chunk> {
        self.rx.clone()
    }

    /// Account for `chunk`, queue whatever became ready, and close the queue
    /// on the delivery that completes the batch.
    pub fn deliver(&self, chunk: Chunk) -> Result<()> {
        let primed = self.assignments.prime(chunk)?;
        for ready in primed.ready {
            self.tx.try_send(ready).map_err(|_| EngineError::QueueClosed {
                module: self.name.to_string(),
            })?;
        }
        if primed.complete {
            self.tx.close();
        }
        Ok(())
    }

    pub fn close(&self) {
        self.tx.close();
    }

    pub fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }
}
