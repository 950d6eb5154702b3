use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-length buffer of group elements shared between workers.
///
/// Workers own disjoint index ranges; the chunk hand-off through the graph's
/// queues orders writes before downstream reads, so relaxed atomics suffice.
pub struct IntBuffer {
    values: Box<[AtomicU64]>,
}

impl IntBuffer {
    pub fn new(len: usize, fill: u64) -> Self {
        Self {
            values: (0..len).map(|_| AtomicU64::new(fill)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Panics when `index` is out of bounds, like slice indexing.
    pub fn get(&self, index: usize) -> u64 {
        self.values[index].load(Ordering::Relaxed)
    }

    pub fn set(&self, index: usize, value: u64) {
        self.values[index].store(value, Ordering::Relaxed);
    }

    pub fn to_vec(&self) -> Vec<u64> {
        self.values.iter().map(|v| v.load(Ordering::Relaxed)).collect()
    }
}

impl fmt::Debug for IntBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntBuffer").field("len", &self.len()).finish()
    }
}
