use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use mix_types::RoundId;

use crate::error::{Result, RoundError};
use crate::round::Round;

/// Retired ids kept individually before the oldest folds into the floor.
pub const RETIRED_WINDOW: usize = 1024;

/// Ids that may not be reused. The most recent `window` are kept exactly;
/// anything at or below `floor` counts as retired as well.
#[derive(Debug)]
struct Retired {
    window: usize,
    floor: Option<RoundId>,
    recent: BTreeSet<RoundId>,
}

impl Retired {
    fn insert(&mut self, id: RoundId) {
        if self.contains(id) {
            return;
        }
        self.recent.insert(id);
        while self.recent.len() > self.window {
            let Some(oldest) = self.recent.pop_first() else { break };
            self.floor = Some(self.floor.map_or(oldest, |f| f.max(oldest)));
        }
    }

    fn contains(&self, id: RoundId) -> bool {
        self.floor.is_some_and(|f| id <= f) || self.recent.contains(&id)
    }
}

/// Live rounds of a node, keyed by id. An id is only ever used once: removed
/// rounds stay retired so a replayed `StartRound` cannot recreate them.
#[derive(Debug)]
pub struct RoundManager {
    rounds: RwLock<HashMap<RoundId, Arc<Round>>>,
    retired: RwLock<Retired>,
}

impl Default for RoundManager {
    fn default() -> Self {
        Self::with_retired_window(RETIRED_WINDOW)
    }
}

impl RoundManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retired_window(window: usize) -> Self {
        Self {
            rounds: RwLock::new(HashMap::new()),
            retired: RwLock::new(Retired {
                window: window.max(1),
                floor: None,
                recent: BTreeSet::new(),
            }),
        }
    }

    pub fn add(&self, round: Round) -> Result<Arc<Round>> {
        let id = round.id();
        if self.is_retired(id) {
            return Err(RoundError::DuplicateRound(id));
        }
        let mut rounds = self.rounds.write().unwrap_or_else(PoisonError::into_inner);
        if rounds.contains_key(&id) {
            return Err(RoundError::DuplicateRound(id));
        }
        let round = Arc::new(round);
        rounds.insert(id, Arc::clone(&round));
        Ok(round)
    }

    pub fn get(&self, id: RoundId) -> Result<Arc<Round>> {
        self.rounds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(RoundError::UnknownRound(id))
    }

    pub fn contains(&self, id: RoundId) -> bool {
        self.rounds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn remove(&self, id: RoundId) -> Option<Arc<Round>> {
        self.retired
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        let removed = self
            .rounds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            info!(round_id = id, "round removed");
        }
        removed
    }

    pub fn is_retired(&self, id: RoundId) -> bool {
        self.retired
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Ids of live rounds, ascending.
    pub fn round_ids(&self) -> Vec<RoundId> {
        let mut ids: Vec<_> = self
            .rounds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.rounds.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
