//! One round on one node: the ordered phase list, the response table that
//! gates inbound messages, and the shared key buffers.
//!
//! ```text
//!   phases[0] ──finish──▶ phases[1] ──finish──▶ … ──finish──▶ complete
//!   Available              Initialized→Available
//! ```
//!
//! Exactly one phase is current. Finishing it makes the next one Available;
//! finishing the last completes the round.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use mix_cryptops::CyclicGroup;
use mix_types::{NodeId, PhaseState, PhaseTag, PhaseType, RoundId, Topology};

use crate::buffer::RoundBuffer;
use crate::error::{Result, RoundError};
use crate::measure::Metrics;
use crate::phase::Phase;
use crate::response::ResponseMap;
use crate::streams::LinkSource;

/// Identity and sizing of a new round.
#[derive(Debug, Clone)]
pub struct RoundParams {
    pub id: RoundId,
    pub batch_size: u32,
    pub topology: Vec<NodeId>,
    pub node_id: NodeId,
    pub grp: CyclicGroup,
}

pub struct Round {
    id: RoundId,
    batch_size: u32,
    topology: Topology,
    node_id: NodeId,
    grp: CyclicGroup,
    phases: Vec<Phase>,
    responses: ResponseMap,
    current: AtomicUsize,
    complete: AtomicBool,
    buffer: Arc<RoundBuffer>,
    changed: watch::Sender<u64>,
    metrics: Metrics,
}

impl Round {
    /// Validate the round, build and link every phase graph against one
    /// shared buffer, and make the first phase Available.
    pub fn new(params: RoundParams, mut phases: Vec<Phase>, responses: ResponseMap) -> Result<Self> {
        let RoundParams {
            id,
            batch_size,
            topology,
            node_id,
            grp,
        } = params;

        let topology =
            Topology::new(topology).map_err(|e| RoundError::InvalidTopology(e.to_string()))?;
        match topology.occurrences(&node_id) {
            1 => {}
            0 => {
                return Err(RoundError::InvalidTopology(format!(
                    "node {node_id} is not part of the topology"
                )))
            }
            n => {
                return Err(RoundError::InvalidTopology(format!(
                    "node {node_id} appears {n} times"
                )))
            }
        }
        if batch_size == 0 {
            return Err(RoundError::InvalidRound("batch size must be > 0".into()));
        }
        if phases.is_empty() {
            return Err(RoundError::InvalidRound("round has no phases".into()));
        }

        let mut present = HashSet::new();
        for p in &phases {
            if !present.insert(p.phase_type()) {
                return Err(RoundError::InvalidRound(format!(
                    "phase {} listed twice",
                    p.phase_type()
                )));
            }
        }
        for (tag, r) in responses.iter() {
            for t in [r.phase_lookup(), r.return_phase()] {
                if !present.contains(&t) {
                    return Err(RoundError::InvalidRound(format!(
                        "response {tag} references missing phase {t}"
                    )));
                }
            }
        }

        for p in phases.iter_mut() {
            let size = p.phase_type().graph_batch_size(batch_size);
            p.graph_mut().build(size)?;
        }
        let capacity = phases
            .iter()
            .map(|p| p.graph().expanded_batch_size())
            .max()
            .unwrap_or(batch_size);
        let buffer = Arc::new(RoundBuffer::new(batch_size, capacity));
        for p in phases.iter_mut() {
            p.graph_mut().link(LinkSource {
                grp,
                buffer: Arc::clone(&buffer),
            })?;
        }
        phases[0].transition(PhaseState::Available)?;

        let (changed, _) = watch::channel(0);
        let metrics = Metrics::default();
        metrics.measure("Created");
        info!(
            round_id = id,
            node = %node_id,
            batch_size,
            capacity,
            phases = phases.len(),
            "round created"
        );

        Ok(Self {
            id,
            batch_size,
            topology,
            node_id,
            grp,
            phases,
            responses,
            current: AtomicUsize::new(0),
            complete: AtomicBool::new(false),
            buffer,
            changed,
            metrics,
        })
    }

    // ── Lookup ───────────────────────────────────────────────────────────

    pub fn phase(&self, phase: PhaseType) -> Result<&Phase> {
        self.phases
            .iter()
            .find(|p| p.phase_type() == phase)
            .ok_or(RoundError::UnknownPhase {
                round_id: self.id,
                phase,
            })
    }

    fn index_of(&self, phase: PhaseType) -> Result<usize> {
        self.phases
            .iter()
            .position(|p| p.phase_type() == phase)
            .ok_or(RoundError::UnknownPhase {
                round_id: self.id,
                phase,
            })
    }

    pub fn current_phase(&self) -> &Phase {
        &self.phases[self.current.load(Ordering::Acquire)]
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    // ── Gate ─────────────────────────────────────────────────────────────

    /// Resolve an inbound tag to the phase it feeds, rejecting it unless the
    /// looked-up phase is in one of the expected states.
    pub fn gate(&self, tag: &PhaseTag) -> Result<&Phase> {
        let response = self.responses.get(tag)?;
        let lookup = self.phase(response.phase_lookup())?;
        let state = lookup.state();
        if !response.check_state(state) {
            return Err(RoundError::UnexpectedState {
                tag: tag.to_string(),
                phase: lookup.phase_type(),
                state,
                expected: response.expected_states().to_vec(),
            });
        }
        self.phase(response.return_phase())
    }

    /// Like [`gate`](Self::gate), but a message that arrives before its phase
    /// is reachable waits up to `timeout` for the round to catch up. A
    /// message for a phase already past every expected state fails at once.
    pub async fn await_gate(&self, tag: &PhaseTag, timeout: Duration) -> Result<&Phase> {
        let response = self.responses.get(tag)?;
        let lookup = self.phase(response.phase_lookup())?;
        let mut rx = self.changed.subscribe();

        let caught_up = async {
            loop {
                let _ = rx.borrow_and_update();
                if !response.is_behind(lookup.state()) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(timeout, caught_up).await.is_err() {
            return Err(RoundError::GateTimeout { tag: tag.to_string() });
        }
        self.gate(tag)
    }

    // ── Transitions ──────────────────────────────────────────────────────

    /// Available → Queued. Returns whether this call queued the phase; later
    /// callers see `false` and must not enqueue it again.
    pub fn queue_phase(&self, phase: PhaseType) -> Result<bool> {
        let queued = self
            .phase(phase)?
            .attempt_transition(PhaseState::Available, PhaseState::Queued);
        if queued {
            self.notify();
        }
        Ok(queued)
    }

    /// Queued → Running.
    pub fn start_phase(&self, phase: PhaseType) -> Result<()> {
        self.phase(phase)?.transition(PhaseState::Running)?;
        self.notify();
        Ok(())
    }

    /// Running → Finished for the current phase, then make the next phase
    /// Available. Returns whether the round is now complete.
    pub fn finish_phase(&self, phase: PhaseType) -> Result<bool> {
        let idx = self.index_of(phase)?;
        let current = self.current.load(Ordering::Acquire);
        if idx != current {
            return Err(RoundError::OutOfOrder {
                phase,
                current: self.phases[current].phase_type(),
            });
        }

        self.phases[idx].transition(PhaseState::Finished)?;
        let complete = match self.phases.get(idx + 1) {
            Some(next) => {
                self.current.store(idx + 1, Ordering::Release);
                next.transition(PhaseState::Available)?;
                false
            }
            None => {
                self.complete.store(true, Ordering::Release);
                self.metrics.measure("Completed");
                true
            }
        };
        self.notify();

        info!(round_id = self.id, %phase, complete, "phase finished");
        Ok(complete)
    }

    /// Finish a phase that was waiting on a verification message.
    pub fn verify_phase(&self, phase: PhaseType) -> Result<bool> {
        if !self.phase(phase)?.requires_verification() {
            return Err(RoundError::NoVerification(phase));
        }
        debug!(round_id = self.id, %phase, "phase verified");
        self.finish_phase(phase)
    }

    /// Receiver bumped on every phase state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn notify(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Kill every phase graph. Returns the first kill failure.
    pub async fn kill(&self, timeout: Duration) -> Result<()> {
        let kills = self.phases.iter().map(|p| p.graph().kill(timeout));
        let results = futures::future::join_all(kills).await;
        results.into_iter().find_map(|r| r.err()).map_or(Ok(()), |e| Err(e.into()))
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn is_first_node(&self) -> bool {
        self.topology.is_first(&self.node_id)
    }

    pub fn is_last_node(&self) -> bool {
        self.topology.is_last(&self.node_id)
    }

    /// Successor of this node in the ring.
    pub fn next_node(&self) -> Option<&NodeId> {
        self.topology.next(&self.node_id)
    }

    pub fn group(&self) -> &CyclicGroup {
        &self.grp
    }

    pub fn buffer(&self) -> &Arc<RoundBuffer> {
        &self.buffer
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn responses(&self) -> &ResponseMap {
        &self.responses
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl std::fmt::Debug for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Round")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("batch_size", &self.batch_size)
            .field("current", &self.current_phase().phase_type())
            .field("complete", &self.is_complete())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;
    use crate::streams::{decrypt, permute};
    use crate::transmit::DiscardHandler;
    use mix_engine::GraphGenerator;

    fn gen() -> GraphGenerator {
        GraphGenerator::new(4, 1, 0, 0.0).unwrap()
    }

    fn params(topology: &[&str], node: &str) -> RoundParams {
        RoundParams {
            id: 7,
            batch_size: 6,
            topology: topology.iter().map(|n| NodeId::from(*n)).collect(),
            node_id: NodeId::from(node),
            grp: CyclicGroup::new((1u64 << 61) - 1, 37).unwrap(),
        }
    }

    fn phases() -> Vec<Phase> {
        let handler = Arc::new(DiscardHandler);
        vec![
            Phase::new(
                PhaseType::RealDecrypt,
                decrypt::realtime_graph(&gen()),
                handler.clone(),
                Duration::from_secs(5),
                false,
            ),
            Phase::new(
                PhaseType::RealPermute,
                permute::realtime_graph(&gen()).unwrap(),
                handler,
                Duration::from_secs(5),
                false,
            ),
        ]
    }

    fn responses() -> ResponseMap {
        let mut map = ResponseMap::new();
        map.insert(
            PhaseTag::new(PhaseType::RealDecrypt),
            Response::direct(PhaseType::RealDecrypt, &PhaseState::ACTIVE),
        );
        map.insert(
            PhaseTag::new(PhaseType::RealPermute),
            Response::direct(PhaseType::RealPermute, &PhaseState::ACTIVE),
        );
        map
    }

    fn round() -> Round {
        Round::new(params(&["a", "b", "c"], "b"), phases(), responses()).unwrap()
    }

    fn run_to_finished(r: &Round, phase: PhaseType) -> bool {
        assert!(r.queue_phase(phase).unwrap());
        r.start_phase(phase).unwrap();
        r.finish_phase(phase).unwrap()
    }

    #[test]
    fn creation_validates_topology() {
        let missing = Round::new(params(&["a", "c"], "b"), phases(), responses());
        assert!(matches!(missing, Err(RoundError::InvalidTopology(_))));

        let twice = Round::new(params(&["b", "a", "b"], "b"), phases(), responses());
        assert!(matches!(twice, Err(RoundError::InvalidTopology(_))));

        let empty = Round::new(params(&[], "b"), phases(), responses());
        assert!(matches!(empty, Err(RoundError::InvalidTopology(_))));
    }

    #[test]
    fn creation_rejects_dangling_responses() {
        let mut map = responses();
        map.insert(
            PhaseTag::new(PhaseType::PrecompShare),
            Response::direct(PhaseType::PrecompShare, &PhaseState::ACTIVE),
        );
        let r = Round::new(params(&["a", "b"], "b"), phases(), map);
        assert!(matches!(r, Err(RoundError::InvalidRound(_))));
    }

    #[test]
    fn shared_buffer_covers_every_graph() {
        let r = round();
        assert_eq!(r.buffer().capacity(), 8);
        for p in r.phases() {
            assert_eq!(p.graph().batch_size(), 6);
            assert_eq!(p.graph().expanded_batch_size(), 8);
        }
        assert!(!r.is_last_node() && !r.is_first_node());
        assert_eq!(r.next_node(), Some(&NodeId::from("c")));
    }

    #[test]
    fn phases_advance_in_declared_order() {
        let r = round();
        assert_eq!(r.current_phase().phase_type(), PhaseType::RealDecrypt);
        assert_eq!(r.phase(PhaseType::RealDecrypt).unwrap().state(), PhaseState::Available);
        assert_eq!(r.phase(PhaseType::RealPermute).unwrap().state(), PhaseState::Initialized);

        let err = r.finish_phase(PhaseType::RealPermute).unwrap_err();
        assert!(matches!(err, RoundError::OutOfOrder { .. }));

        assert!(!run_to_finished(&r, PhaseType::RealDecrypt));
        assert_eq!(r.current_phase().phase_type(), PhaseType::RealPermute);
        assert_eq!(r.phase(PhaseType::RealPermute).unwrap().state(), PhaseState::Available);

        assert!(run_to_finished(&r, PhaseType::RealPermute));
        assert!(r.is_complete());
        assert!(r.metrics().elapsed("Created", "Completed").is_some());
    }

    #[test]
    fn queue_phase_only_once() {
        let r = round();
        assert!(r.queue_phase(PhaseType::RealDecrypt).unwrap());
        assert!(!r.queue_phase(PhaseType::RealDecrypt).unwrap());
        assert!(!r.queue_phase(PhaseType::RealPermute).unwrap());
    }

    #[test]
    fn gate_routes_active_and_rejects_finished() {
        let r = round();
        let target = r.gate(&PhaseTag::new(PhaseType::RealDecrypt)).unwrap();
        assert_eq!(target.phase_type(), PhaseType::RealDecrypt);

        let early = r.gate(&PhaseTag::new(PhaseType::RealPermute)).unwrap_err();
        assert!(matches!(
            early,
            RoundError::UnexpectedState { state: PhaseState::Initialized, .. }
        ));

        run_to_finished(&r, PhaseType::RealDecrypt);
        let late = r.gate(&PhaseTag::new(PhaseType::RealDecrypt)).unwrap_err();
        assert!(matches!(
            late,
            RoundError::UnexpectedState { state: PhaseState::Finished, .. }
        ));

        let unknown = r.gate(&PhaseTag::verification(PhaseType::RealDecrypt)).unwrap_err();
        assert!(matches!(unknown, RoundError::MissingResponse { .. }));
    }

    #[test]
    fn verify_requires_a_verification_phase() {
        let r = round();
        assert!(matches!(
            r.verify_phase(PhaseType::RealDecrypt),
            Err(RoundError::NoVerification(PhaseType::RealDecrypt))
        ));
    }

    #[tokio::test]
    async fn await_gate_waits_for_the_round() {
        let r = Arc::new(round());
        let waiter = {
            let r = Arc::clone(&r);
            tokio::spawn(async move {
                r.await_gate(&PhaseTag::new(PhaseType::RealPermute), Duration::from_secs(5))
                    .await
                    .map(|p| p.phase_type())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        run_to_finished(&r, PhaseType::RealDecrypt);
        assert_eq!(waiter.await.unwrap().unwrap(), PhaseType::RealPermute);
    }

    #[tokio::test]
    async fn await_gate_rejects_past_and_times_out() {
        let r = round();
        run_to_finished(&r, PhaseType::RealDecrypt);
        let past = r
            .await_gate(&PhaseTag::new(PhaseType::RealDecrypt), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(past, RoundError::UnexpectedState { .. }));

        let r = round();
        let stuck = r
            .await_gate(&PhaseTag::new(PhaseType::RealPermute), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(stuck, RoundError::GateTimeout { .. }));
    }
}
