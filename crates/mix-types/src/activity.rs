use std::fmt;

use serde::{Deserialize, Serialize};

// ── Activity ─────────────────────────────────────────────────────────────────

/// What a node is doing, across rounds.
///
/// ```text
///   NotStarted → Waiting → Precomputing → Standby → Realtime → Completed
///                   ▲                                            │
///                   └────────────────────────────────────────────┘
///   any of the above → Error → Crash
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activity {
    /// Process is up, nothing is scheduled yet.
    NotStarted,
    /// Ready for the next round.
    Waiting,
    /// A round's precomputation is running.
    Precomputing,
    /// Precomputation is done; the round waits for its batch.
    Standby,
    /// The batch is being mixed.
    Realtime,
    /// The last round finished cleanly.
    Completed,
    /// A round failed. The node takes no more work.
    Error,
    /// The failure could not be contained; compute state is untrusted.
    Crash,
}

impl Activity {
    /// Whether `self → next` is a legal transition.
    pub fn can_move_to(self, next: Self) -> bool {
        use Activity::*;
        match (self, next) {
            (Error, Crash) => true,
            (Error | Crash, _) => false,
            (_, Error) => true,
            (NotStarted, Waiting)
            | (Waiting, Precomputing)
            | (Precomputing, Standby)
            | (Standby, Realtime)
            | (Realtime, Completed)
            | (Completed, Waiting) => true,
            _ => false,
        }
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::Error | Self::Crash)
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted   => write!(f, "NotStarted"),
            Self::Waiting      => write!(f, "Waiting"),
            Self::Precomputing => write!(f, "Precomputing"),
            Self::Standby      => write!(f, "Standby"),
            Self::Realtime     => write!(f, "Realtime"),
            Self::Completed    => write!(f, "Completed"),
            Self::Error        => write!(f, "Error"),
            Self::Crash        => write!(f, "Crash"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_cycle_is_legal() {
        let cycle = [
            Activity::NotStarted,
            Activity::Waiting,
            Activity::Precomputing,
            Activity::Standby,
            Activity::Realtime,
            Activity::Completed,
            Activity::Waiting,
        ];
        assert!(cycle.windows(2).all(|w| w[0].can_move_to(w[1])));
    }

    #[test]
    fn skipping_or_reversing_is_not() {
        assert!(!Activity::Waiting.can_move_to(Activity::Standby));
        assert!(!Activity::Precomputing.can_move_to(Activity::Realtime));
        assert!(!Activity::Standby.can_move_to(Activity::Precomputing));
        assert!(!Activity::Completed.can_move_to(Activity::Precomputing));
        assert!(!Activity::Waiting.can_move_to(Activity::Waiting));
    }

    #[test]
    fn error_only_leads_to_crash() {
        assert!(Activity::Realtime.can_move_to(Activity::Error));
        assert!(Activity::NotStarted.can_move_to(Activity::Error));
        assert!(Activity::Error.can_move_to(Activity::Crash));
        assert!(!Activity::Error.can_move_to(Activity::Waiting));
        assert!(!Activity::Crash.can_move_to(Activity::Error));
        assert!(!Activity::Crash.can_move_to(Activity::Waiting));
        assert!(Activity::Crash.is_failed() && Activity::Error.is_failed());
    }
}
