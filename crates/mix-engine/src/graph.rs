// Graph assembly, batch expansion and worker execution.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use mix_types::Slot;

use crate::chunk::Chunk;
use crate::error::{EngineError, GraphFailure, Result, StreamError};
use crate::generator::GraphGenerator;
use crate::module::{BoundModule, InputSize, ModuleId, ModuleTemplate, NumThreads};
use crate::stream::Stream;

/// Egress of a graph: one notification per processed output range.
pub type ChunkReceiver = async_channel::Receiver<Chunk>;

const OUTPUT_MODULE: &str = "Output";

/// State shared with the workers once the graph is built.
struct GraphCore<S> {
    name: String,
    modules: Vec<BoundModule<S>>,
    first: ModuleId,
    output: ModuleId,
    killed: AtomicBool,
    failure: watch::Sender<Option<GraphFailure>>,
}

impl<S> GraphCore<S> {
    fn module(&self, id: ModuleId) -> &BoundModule<S> {
        &self.modules[id.0]
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Record the first failure; later ones are only logged.
    fn fail(&self, module: &str, reason: String) {
        warn!(graph = %self.name, module, %reason, "module failed");
        let failure = GraphFailure {
            graph: self.name.clone(),
            module: module.to_string(),
            reason,
        };
        self.failure.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(failure);
                true
            } else {
                false
            }
        });
    }

    fn close_all(&self) {
        for module in &self.modules {
            module.close();
        }
    }
}

// ── Graph ────────────────────────────────────────────────────────────────────

/// A chain of module copies sharing one stream.
///
/// Lifecycle: add modules and edges, then `build` → `link` → `run`. Input
/// arrives through `send`; results leave through `chunk_done`.
pub struct Graph<S: Stream> {
    name: String,
    generator: GraphGenerator,
    templates: Vec<ModuleTemplate<S>>,
    edges: Vec<(ModuleId, ModuleId)>,
    first: Option<ModuleId>,
    last: Option<ModuleId>,
    batch_size: u32,
    expanded_batch_size: u32,
    core: Option<Arc<GraphCore<S>>>,
    stream: Option<Arc<S>>,
    running: AtomicBool,
    sent: AtomicU32,
    padded: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Stream> Graph<S> {
    pub(crate) fn new(name: String, generator: GraphGenerator) -> Self {
        Self {
            name,
            generator,
            templates: Vec::new(),
            edges: Vec::new(),
            first: None,
            last: None,
            batch_size: 0,
            expanded_batch_size: 0,
            core: None,
            stream: None,
            running: AtomicBool::new(false),
            sent: AtomicU32::new(0),
            padded: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    // ── Assembly ─────────────────────────────────────────────────────────

    /// Copy `template` into this graph.
    pub fn add_module(&mut self, template: &ModuleTemplate<S>) -> ModuleId {
        self.templates.push(*template);
        ModuleId(self.templates.len() - 1)
    }

    pub fn first(&mut self, id: ModuleId) {
        self.first = Some(id);
    }

    pub fn last(&mut self, id: ModuleId) {
        self.last = Some(id);
    }

    /// Route every chunk `from` finishes into `to`.
    pub fn connect(&mut self, from: ModuleId, to: ModuleId) {
        self.edges.push((from, to));
    }

    // ── Build ────────────────────────────────────────────────────────────

    /// Validate the chain, expand the batch and allocate module queues.
    pub fn build(&mut self, batch_size: u32) -> Result<()> {
        let graph = self.name.clone();
        if self.core.is_some() {
            return Err(EngineError::AlreadyBuilt { graph });
        }
        if self.templates.is_empty() {
            return Err(EngineError::NoModules { graph });
        }
        let first = self.first.ok_or_else(|| EngineError::NoFirstModule { graph: graph.clone() })?;
        let last = self.last.ok_or_else(|| EngineError::NoLastModule { graph: graph.clone() })?;
        if batch_size == 0 {
            return Err(EngineError::ZeroBatch { graph });
        }

        let outputs = self.check_chain(first, last)?;

        let min = self.generator.min_input_size();
        let output_size = self.generator.output_size();
        let mut lcm_all = lcm(min, output_size);
        for t in &self.templates {
            if let InputSize::Fixed(size) = t.input_size {
                if size == 0 || (size % min != 0 && min % size != 0) {
                    return Err(EngineError::InvalidGranularity {
                        graph,
                        module: t.name.to_string(),
                        size,
                        min,
                    });
                }
                lcm_all = lcm(lcm_all, size);
            }
        }

        let expanded = u64::from(batch_size).div_ceil(u64::from(lcm_all)) * u64::from(lcm_all);
        let expanded = u32::try_from(expanded)
            .map_err(|_| EngineError::BatchTooLarge { graph: graph.clone(), batch_size })?;

        let output = ModuleId(self.templates.len());
        let mut modules = Vec::with_capacity(self.templates.len() + 1);
        for (i, (t, mut outs)) in self.templates.iter().zip(outputs).enumerate() {
            let granularity = match t.input_size {
                InputSize::Auto => min,
                InputSize::Fixed(size) => size,
                InputSize::Batch => expanded,
            };
            let threads = match t.num_threads {
                NumThreads::Auto => self.generator.default_num_threads(),
                NumThreads::Fixed(n) => n,
            };
            if threads == 0 {
                return Err(EngineError::ZeroThreads {
                    graph,
                    module: t.name.to_string(),
                });
            }
            if i == last.0 {
                outs.push(output);
            }
            modules.push(BoundModule::new(
                t.name,
                Some(t.adapter),
                granularity,
                threads,
                t.start_threshold,
                expanded,
                outs,
            ));
        }
        modules.push(BoundModule::new(
            OUTPUT_MODULE,
            None,
            output_size,
            0,
            self.generator.output_threshold(),
            expanded,
            Vec::new(),
        ));

        let (failure, _) = watch::channel(None);
        self.core = Some(Arc::new(GraphCore {
            name: self.name.clone(),
            modules,
            first,
            output,
            killed: AtomicBool::new(false),
            failure,
        }));
        self.batch_size = batch_size;
        self.expanded_batch_size = expanded;

        debug!(graph = %self.name, batch_size, expanded, "graph built");
        Ok(())
    }

    /// Every edge must point inside the graph, every module must be reachable
    /// from `first`, `last` must be a sink and the chain must be acyclic.
    /// Returns the downstream modules of each module.
    fn check_chain(&self, first: ModuleId, last: ModuleId) -> Result<Vec<Vec<ModuleId>>> {
        let graph = || self.name.clone();
        let n = self.templates.len();
        let ids = [first, last]
            .into_iter()
            .chain(self.edges.iter().flat_map(|(a, b)| [*a, *b]));
        for id in ids {
            if id.0 >= n {
                return Err(EngineError::UnknownModule { graph: graph(), id: id.0 });
            }
        }

        let mut outputs = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        for (from, to) in &self.edges {
            outputs[from.0].push(*to);
            indegree[to.0] += 1;
        }

        if !outputs[last.0].is_empty() {
            return Err(EngineError::MalformedChain {
                graph: graph(),
                reason: format!("last module {} has outgoing edges", self.templates[last.0].name),
            });
        }
        if indegree[first.0] != 0 {
            return Err(EngineError::MalformedChain {
                graph: graph(),
                reason: "first module has incoming edges".into(),
            });
        }

        let mut reachable = vec![false; n];
        let mut queue = VecDeque::from([first.0]);
        reachable[first.0] = true;
        while let Some(i) = queue.pop_front() {
            for out in &outputs[i] {
                if !reachable[out.0] {
                    reachable[out.0] = true;
                    queue.push_back(out.0);
                }
            }
        }
        if let Some(i) = reachable.iter().position(|r| !r) {
            return Err(EngineError::MalformedChain {
                graph: graph(),
                reason: format!("module {} unreachable from first", self.templates[i].name),
            });
        }

        // Kahn's algorithm; leftovers mean a cycle.
        let mut ready = VecDeque::from([first.0]);
        let mut visited = 0;
        while let Some(i) = ready.pop_front() {
            visited += 1;
            for out in &outputs[i] {
                indegree[out.0] -= 1;
                if indegree[out.0] == 0 {
                    ready.push_back(out.0);
                }
            }
        }
        if visited != n {
            return Err(EngineError::MalformedChain {
                graph: graph(),
                reason: "cycle between modules".into(),
            });
        }
        Ok(outputs)
    }

    // ── Link / Run ───────────────────────────────────────────────────────

    pub fn link(&mut self, source: S::Source) -> std::result::Result<(), LinkError> {
        if self.core.is_none() {
            return Err(EngineError::NotBuilt { graph: self.name.clone() }.into());
        }
        if self.stream.is_some() {
            return Err(EngineError::AlreadyLinked { graph: self.name.clone() }.into());
        }
        self.stream = Some(Arc::new(S::link(self.expanded_batch_size, source)?));
        Ok(())
    }

    /// Start `num_threads` workers for every module. Must run inside a Tokio
    /// runtime.
    pub fn run(&self) -> Result<()> {
        let core = self.core()?;
        let stream = self
            .stream
            .clone()
            .ok_or_else(|| EngineError::NotLinked { graph: self.name.clone() })?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyRunning { graph: self.name.clone() });
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for (i, module) in core.modules.iter().enumerate() {
            if module.adapter.is_none() {
                continue;
            }
            for _ in 0..module.num_threads {
                workers.push(tokio::spawn(worker(
                    Arc::clone(core),
                    Arc::clone(&stream),
                    ModuleId(i),
                )));
            }
        }
        debug!(graph = %self.name, workers = workers.len(), "graph running");
        Ok(())
    }

    // ── Ingress / egress ─────────────────────────────────────────────────

    /// Deliver a chunk of the real batch. When the batch is complete the
    /// padding range up to the expanded size is delivered as well.
    ///
    /// Only accepted chunks count toward the batch: a chunk the first module
    /// rejects releases its reservation, so the rest of the batch still fits.
    pub fn send(&self, chunk: Chunk) -> Result<()> {
        let core = self.core()?;
        if chunk.is_empty() {
            return Ok(());
        }
        if chunk.end() > self.batch_size {
            return Err(EngineError::ChunkOutOfBatch {
                graph: self.name.clone(),
                begin: chunk.begin(),
                end: chunk.end(),
                batch_size: self.batch_size,
            });
        }

        let len = chunk.len();
        let batch = self.batch_size;
        let before = self
            .sent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |sent| {
                (sent + len <= batch).then_some(sent + len)
            })
            .map_err(|_| EngineError::BatchOverflow {
                graph: self.name.clone(),
                len,
                batch_size: batch,
            })?;

        let first = core.module(core.first);
        if let Err(e) = first.deliver(chunk) {
            self.sent.fetch_sub(len, Ordering::AcqRel);
            return Err(e);
        }
        if before + len == batch
            && self.expanded_batch_size > batch
            && !self.padded.swap(true, Ordering::AcqRel)
        {
            first.deliver(Chunk::new(batch, self.expanded_batch_size))?;
        }
        Ok(())
    }

    /// Store a wire slot into the stream.
    pub fn input(&self, index: u32, slot: &Slot) -> std::result::Result<(), StreamError> {
        self.stream.as_ref().ok_or(StreamError::NotLinked)?.input(index, slot)
    }

    pub fn output(&self, index: u32) -> std::result::Result<Slot, StreamError> {
        self.stream.as_ref().ok_or(StreamError::NotLinked)?.output(index)
    }

    pub fn chunk_done(&self) -> Result<ChunkReceiver> {
        let core = self.core()?;
        Ok(core.module(core.output).receiver())
    }

    /// Resolves with the first worker failure. Never resolves on a healthy
    /// graph.
    pub async fn failed(&self) -> GraphFailure {
        let Some(core) = &self.core else {
            return std::future::pending().await;
        };
        let mut rx = core.failure.subscribe();
        loop {
            if let Some(failure) = rx.borrow_and_update().clone() {
                return failure;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    // ── Kill ─────────────────────────────────────────────────────────────

    /// Stop workers after their current chunk, waiting at most `timeout`.
    pub async fn kill(&self, timeout: Duration) -> Result<()> {
        let Some(core) = &self.core else {
            return Ok(());
        };
        core.killed.store(true, Ordering::Release);
        core.close_all();

        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => {
                debug!(graph = %self.name, "graph killed");
                Ok(())
            }
            Err(_) => {
                warn!(graph = %self.name, ?timeout, "graph workers did not stop");
                Err(EngineError::KillTimeout {
                    graph: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn expanded_batch_size(&self) -> u32 {
        self.expanded_batch_size
    }

    pub fn is_built(&self) -> bool {
        self.core.is_some()
    }

    pub fn is_linked(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_killed(&self) -> bool {
        self.core.as_ref().is_some_and(|c| c.is_killed())
    }

    pub fn stream(&self) -> Option<&Arc<S>> {
        self.stream.as_ref()
    }

    /// Granularity a module was bound with. `None` before `build`.
    pub fn module_granularity(&self, id: ModuleId) -> Option<u32> {
        self.core.as_ref()?.modules.get(id.0).map(|m| m.granularity())
    }

    /// Adapter invocations completed by a module so far.
    pub fn module_invocations(&self, id: ModuleId) -> u64 {
        self.core
            .as_ref()
            .and_then(|c| c.modules.get(id.0))
            .map_or(0, |m| m.invocations.load(Ordering::Relaxed))
    }

    fn core(&self) -> Result<&Arc<GraphCore<S>>> {
        self.core
            .as_ref()
            .ok_or_else(|| EngineError::NotBuilt { graph: self.name.clone() })
    }
}

impl<S: Stream> Drop for Graph<S> {
    fn drop(&mut self) {
        if let Some(core) = &self.core {
            core.killed.store(true, Ordering::Release);
            core.close_all();
        }
    }
}

/// Failure of [`Graph::link`]: either a lifecycle error or the stream
/// refusing its source.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

// ── Worker ───────────────────────────────────────────────────────────────────

async fn worker<S: Stream>(core: Arc<GraphCore<S>>, stream: Arc<S>, id: ModuleId) {
    let module = core.module(id);
    let Some(adapter) = module.adapter else {
        return;
    };
    let rx = module.receiver();

    while let Ok(chunk) = rx.recv().await {
        if core.is_killed() {
            break;
        }

        let s = Arc::clone(&stream);
        let outcome = tokio::task::spawn_blocking(move || adapter(&s, chunk)).await;
        let result = match outcome {
            Ok(inner) => inner.map_err(|e| e.to_string()),
            Err(join) => Err(format!("adapter aborted: {join}")),
        };
        if let Err(reason) = result {
            core.fail(module.name, format!("{chunk}: {reason}"));
            return;
        }
        module.record_invocation();

        for out in &module.outputs {
            if let Err(e) = core.module(*out).deliver(chunk) {
                if !core.is_killed() {
                    core.fail(module.name, e.to_string());
                }
                return;
            }
        }
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: u32, b: u32) -> u32 {
    a / gcd(a, b) * b
}

// ── Tests ────────────────────────────────────────────────────────────────────
