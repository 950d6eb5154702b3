use mix_types::Slot;

use crate::error::StreamError;

/// Buffers one phase's modules read and write, plus the mapping between wire
/// slots and those buffers.
///
/// A stream is created by [`Graph::link`](crate::Graph::link) and owned by that
/// graph for the rest of the round.
pub trait Stream: Send + Sync + Sized + 'static {
    /// External state the stream binds to (round buffers, group, ...).
    type Source;

    const NAME: &'static str;

    /// Bind to `source` for a graph whose expanded batch is `batch_size`.
    fn link(batch_size: u32, source: Self::Source) -> Result<Self, StreamError>;

    /// Store one inbound wire slot at `index`.
    fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError>;

    /// Wire slot for `index` once the graph has processed it.
    fn output(&self, index: u32) -> Result<Slot, StreamError>;
}
