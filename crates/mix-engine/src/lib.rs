//! `mix-engine`: a small parallel dataflow scheduler for chunked batches.
//!
//! A [`Graph`] chains [`Module`](module::ModuleTemplate) copies over one
//! shared [`Stream`]. Each module works at its own granularity; the graph
//! expands the batch to the least common multiple so every module sees whole
//! chunks, and a synthetic output module normalises egress.
//!
//! ```text
//!  send(chunk) ──▶ ┌──────────┐    ┌──────────┐    ┌────────┐
//!                  │ module A │───▶│ module B │───▶│ output │──▶ chunk_done()
//!                  │ size 4   │    │ size 1   │    │ size 4 │
//!                  └──────────┘    └──────────┘    └────────┘
//!                   N workers       M workers       (no workers)
//! ```
//!
//! Completion is accounting-driven: a module's queue closes exactly once,
//! when its [`AssignmentList`](assignment::AssignmentList) has seen every
//! index of the expanded batch.

pub mod assignment;
pub mod chunk;
pub mod error;
pub mod generator;
pub mod graph;
pub mod module;
pub mod stream;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use chunk::Chunk;
pub use error::{AdapterError, EngineError, GraphFailure, Result, StreamError};
pub use generator::GraphGenerator;
pub use graph::{ChunkReceiver, Graph, LinkError};
pub use module::{Adapter, InputSize, ModuleId, ModuleTemplate, NumThreads};
pub use stream::Stream;
