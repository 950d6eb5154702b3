// Per-module delivery accounting.
//
// The expanded batch is divided into assignments of `granularity` indices.
// Incoming chunks of any alignment fill assignments; a full assignment becomes
// one ready chunk for the module's workers. The list reports completion
// exactly once, which is what closes the module's queue.

use std::sync::{Mutex, PoisonError};

use crate::chunk::Chunk;
use crate::error::{EngineError, Result};

/// Outcome of accounting one delivered chunk.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Primed {
    /// Whole assignments released to the module's queue.
    pub ready: Vec<Chunk>,
    /// Set on the single delivery that completed every assignment.
    pub complete: bool,
}

pub struct AssignmentList {
    module: String,
    granularity: u32,
    expanded: u32,
    total: u32,
    release_after: u32,
    state: Mutex<AssignmentState>,
}

struct AssignmentState {
    filled: Vec<u32>,
    completed: u32,
    held: Vec<Chunk>,
    released: bool,
}

impl AssignmentList {
    /// `threshold` is the fraction of assignments that must be full before any
    /// is released; 0 releases each as soon as it fills.
    pub fn new(module: impl Into<String>, expanded: u32, granularity: u32, threshold: f32) -> Self {
        let total = expanded / granularity;
        let release_after =
            ((f64::from(threshold.clamp(0.0, 1.0)) * f64::from(total)).ceil() as u32).min(total);
        Self {
            module: module.into(),
            granularity,
            expanded,
            total,
            release_after,
            state: Mutex::new(AssignmentState {
                filled: vec![0; total as usize],
                completed: 0,
                held: Vec::new(),
                released: release_after == 0,
            }),
        }
    }

    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    /// Number of assignments, i.e. chunks this module processes per batch.
    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn completed(&self) -> u32 {
        self.lock().completed
    }

    pub fn is_complete(&self) -> bool {
        self.completed() == self.total
    }

    /// Account for `chunk`. Rejects the whole chunk, leaving counts untouched,
    /// if any of its indices would overfill an assignment.
    pub fn prime(&self, chunk: Chunk) -> Result<Primed> {
        if chunk.is_empty() {
            return Ok(Primed::default());
        }
        if chunk.end() > self.expanded {
            return Err(EngineError::BeyondBatch {
                module: self.module.clone(),
                index: chunk.end() - 1,
            });
        }

        let g = self.granularity;
        let first = chunk.begin() / g;
        let last = (chunk.end() - 1) / g;

        let mut state = self.lock();

        for a in first..=last {
            let lo = chunk.begin().max(a * g);
            let hi = chunk.end().min((a + 1) * g);
            if state.filled[a as usize] + (hi - lo) > g {
                return Err(EngineError::DuplicateDelivery {
                    module: self.module.clone(),
                    index: lo,
                });
            }
        }

        let mut primed = Primed::default();
        let mut newly_ready = Vec::new();
        for a in first..=last {
            let lo = chunk.begin().max(a * g);
            let hi = chunk.end().min((a + 1) * g);
            let slot = &mut state.filled[a as usize];
            *slot += hi - lo;
            if *slot == g {
                newly_ready.push(Chunk::new(a * g, (a + 1) * g));
            }
        }

        let before = state.completed;
        state.completed += newly_ready.len() as u32;

        if state.released {
            primed.ready = newly_ready;
        } else {
            state.held.extend(newly_ready);
            if state.completed >= self.release_after {
                state.released = true;
                primed.ready = std::mem::take(&mut state.held);
            }
        }

        primed.complete = before < self.total && state.completed == self.total;
        Ok(primed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AssignmentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_chunks_fill_assignments() {
        let list = AssignmentList::new("m", 12, 4, 0.0);
        assert_eq!(list.total(), 3);

        let p = list.prime(Chunk::new(0, 3)).unwrap();
        assert!(p.ready.is_empty());

        let p = list.prime(Chunk::new(3, 9)).unwrap();
        assert_eq!(p.ready, vec![Chunk::new(0, 4), Chunk::new(4, 8)]);
        assert!(!p.complete);

        let p = list.prime(Chunk::new(9, 12)).unwrap();
        assert_eq!(p.ready, vec![Chunk::new(8, 12)]);
        assert!(p.complete);
    }

    #[test]
    fn completion_reported_once() {
        let list = AssignmentList::new("m", 4, 1, 0.0);
        let mut completions = 0;
        for i in [3, 1, 0, 2] {
            if list.prime(Chunk::new(i, i + 1)).unwrap().complete {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
        assert!(list.is_complete());
    }

    #[test]
    fn overfill_rejected_without_side_effects() {
        let list = AssignmentList::new("m", 8, 4, 0.0);
        list.prime(Chunk::new(0, 2)).unwrap();
        let err = list.prime(Chunk::new(1, 6)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateDelivery { index: 1, .. }));

        // 4..6 must not have been counted by the rejected delivery.
        let p = list.prime(Chunk::new(2, 8)).unwrap();
        assert_eq!(p.ready, vec![Chunk::new(0, 4), Chunk::new(4, 8)]);
        assert!(p.complete);
    }

    #[test]
    fn beyond_expanded_rejected() {
        let list = AssignmentList::new("m", 8, 4, 0.0);
        assert!(matches!(
            list.prime(Chunk::new(6, 9)),
            Err(EngineError::BeyondBatch { index: 8, .. })
        ));
    }

    #[test]
    fn threshold_holds_until_fraction_ready() {
        let list = AssignmentList::new("m", 8, 2, 1.0);
        for i in 0..3 {
            let p = list.prime(Chunk::new(i * 2, i * 2 + 2)).unwrap();
            assert!(p.ready.is_empty(), "released early at assignment {i}");
        }
        let p = list.prime(Chunk::new(6, 8)).unwrap();
        assert_eq!(p.ready.len(), 4);
        assert!(p.complete);
    }

    #[test]
    fn half_threshold_then_streams() {
        let list = AssignmentList::new("m", 8, 2, 0.5);
        assert!(list.prime(Chunk::new(0, 2)).unwrap().ready.is_empty());
        assert_eq!(list.prime(Chunk::new(2, 4)).unwrap().ready.len(), 2);
        assert_eq!(list.prime(Chunk::new(4, 6)).unwrap().ready, vec![Chunk::new(4, 6)]);
    }
}
