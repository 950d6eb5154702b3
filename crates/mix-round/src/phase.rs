use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use mix_types::{PhaseState, PhaseType};

use crate::error::{Result, RoundError};
use crate::measure::Metrics;
use crate::streams::PhaseGraph;
use crate::transmit::TransmissionHandler;

/// One step of a round: its graph, its transmission handler and a lifecycle
/// state that only ever moves forward.
///
/// State changes are compare-and-swap on an atomic, so concurrent message
/// handlers and the resource queue may race to advance a phase; exactly one
/// wins each transition. Transitions go through [`Round`](crate::Round) so
/// waiters are woken.
pub struct Phase {
    phase_type: PhaseType,
    graph: PhaseGraph,
    transmitter: Arc<dyn TransmissionHandler>,
    timeout: Duration,
    verification: bool,
    state: AtomicU32,
    metrics: Metrics,
}

impl Phase {
    pub fn new(
        phase_type: PhaseType,
        graph: PhaseGraph,
        transmitter: Arc<dyn TransmissionHandler>,
        timeout: Duration,
        verification: bool,
    ) -> Self {
        Self {
            phase_type,
            graph,
            transmitter,
            timeout,
            verification,
            state: AtomicU32::new(PhaseState::Initialized.as_u32()),
            metrics: Metrics::default(),
        }
    }

    // ── State machine ────────────────────────────────────────────────────

    pub fn state(&self) -> PhaseState {
        PhaseState::from_u32(self.state.load(Ordering::Acquire)).unwrap_or(PhaseState::Initialized)
    }

    /// Move to `to`, which must be the direct successor of the current state.
    pub(crate) fn transition(&self, to: PhaseState) -> Result<()> {
        let from = self.state();
        if from.successor() != Some(to) {
            return Err(RoundError::InvalidTransition {
                phase: self.phase_type,
                from,
                to,
            });
        }
        self.state
            .compare_exchange(from.as_u32(), to.as_u32(), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| RoundError::InvalidTransition {
                phase: self.phase_type,
                from: PhaseState::from_u32(actual).unwrap_or(from),
                to,
            })?;
        self.metrics.measure(to.to_string());
        debug!(phase = %self.phase_type, %from, %to, "phase transition");
        Ok(())
    }

    /// Move `from → to` only if the phase is currently in `from`. Returns
    /// whether this call made the move.
    pub(crate) fn attempt_transition(&self, from: PhaseState, to: PhaseState) -> bool {
        if from.successor() != Some(to) {
            return false;
        }
        let moved = self
            .state
            .compare_exchange(from.as_u32(), to.as_u32(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            self.metrics.measure(to.to_string());
        }
        moved
    }

    pub fn check_state(&self, expected: &[PhaseState]) -> bool {
        expected.contains(&self.state())
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn phase_type(&self) -> PhaseType {
        self.phase_type
    }

    pub fn graph(&self) -> &PhaseGraph {
        &self.graph
    }

    pub(crate) fn graph_mut(&mut self) -> &mut PhaseGraph {
        &mut self.graph
    }

    pub fn transmitter(&self) -> &Arc<dyn TransmissionHandler> {
        &self.transmitter
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether finishing this phase waits for a verification message.
    pub fn requires_verification(&self) -> bool {
        self.verification
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("phase_type", &self.phase_type)
            .field("graph", &self.graph.name())
            .field("state", &self.state())
            .field("verification", &self.verification)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::decrypt;
    use crate::transmit::DiscardHandler;
    use mix_engine::GraphGenerator;

    fn phase() -> Phase {
        let gen = GraphGenerator::new(4, 1, 0, 0.0).unwrap();
        Phase::new(
            PhaseType::PrecompDecrypt,
            decrypt::precomp_graph(&gen),
            Arc::new(DiscardHandler),
            Duration::from_secs(1),
            false,
        )
    }

    #[test]
    fn walks_every_state_once() {
        let p = phase();
        assert_eq!(p.state(), PhaseState::Initialized);
        for to in [
            PhaseState::Available,
            PhaseState::Queued,
            PhaseState::Running,
            PhaseState::Finished,
        ] {
            p.transition(to).unwrap();
            assert_eq!(p.state(), to);
        }
        assert!(p.transition(PhaseState::Finished).is_err());
        let tags: Vec<_> = p.metrics().events().into_iter().map(|m| m.tag).collect();
        assert_eq!(tags, ["Available", "Queued", "Running", "Finished"]);
    }

    #[test]
    fn skipping_or_reversing_is_rejected() {
        let p = phase();
        let err = p.transition(PhaseState::Queued).unwrap_err();
        assert!(matches!(
            err,
            RoundError::InvalidTransition {
                from: PhaseState::Initialized,
                to: PhaseState::Queued,
                ..
            }
        ));
        p.transition(PhaseState::Available).unwrap();
        p.transition(PhaseState::Queued).unwrap();
        assert!(p.transition(PhaseState::Available).is_err());
        assert_eq!(p.state(), PhaseState::Queued);
    }

    #[test]
    fn attempt_transition_has_one_winner() {
        let p = Arc::new(phase());
        p.transition(PhaseState::Available).unwrap();

        let winners: usize = (0..8)
            .map(|_| {
                let p = Arc::clone(&p);
                std::thread::spawn(move || {
                    p.attempt_transition(PhaseState::Available, PhaseState::Queued)
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(p.state(), PhaseState::Queued);
        assert!(!p.attempt_transition(PhaseState::Queued, PhaseState::Finished));
    }
}
