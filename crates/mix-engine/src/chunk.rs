use std::fmt;
use std::ops::Range;

/// Half-open range `[begin, end)` of batch indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chunk {
    begin: u32,
    end: u32,
}

impl Chunk {
    pub fn new(begin: u32, end: u32) -> Self {
        debug_assert!(begin <= end, "chunk begin {begin} after end {end}");
        Self { begin, end }
    }

    pub fn begin(&self) -> u32 {
        self.begin
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn range(&self) -> Range<u32> {
        self.begin..self.end
    }

    /// Same as `range`, widened for indexing buffers.
    pub fn indices(&self) -> Range<usize> {
        self.begin as usize..self.end as usize
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}
