//! Bounded executor for phases that have their first input.
//!
//! ```text
//!  enqueue(round, phase) ──▶ mpsc ──▶ driver ──permit──▶ execute task
//!                                                         Queued → Running
//!                                                         graph.run()
//!                                                         select! { transmit | failed } within timeout
//!                                                              │
//!                                                              ▼
//!                                                          QueueEvent
//! ```
//!
//! A semaphore bounds how many phases run at once across all rounds. `kill`
//! halts the queue and stops every in-flight graph; if a graph does not stop
//! in time the node can no longer be trusted and the error is fatal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use mix_engine::EngineError;
use mix_types::config::ResourceQueueConfig;
use mix_types::{PhaseType, RoundId};

use crate::error::{Result, RoundError};
use crate::failure::RoundFailure;
use crate::round::Round;

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum QueueEvent {
    /// The phase transmitted everything and was finished.
    PhaseFinished {
        round_id: RoundId,
        phase: PhaseType,
        round_complete: bool,
    },
    /// The phase transmitted everything and now waits for a verification
    /// message before it can finish.
    AwaitingVerification { round_id: RoundId, phase: PhaseType },
    Failed(RoundFailure),
}

// ── Queue ────────────────────────────────────────────────────────────────────

struct Request {
    round: Arc<Round>,
    phase: PhaseType,
    /// Kill epoch at enqueue time. Requests from before a kill are dropped.
    epoch: u64,
}

/// Everything `kill` and the driver must see change together.
#[derive(Default)]
struct QueueState {
    halted: bool,
    epoch: u64,
    in_flight: HashMap<(RoundId, PhaseType), Arc<Round>>,
}

impl QueueState {
    fn accepts(&self, epoch: u64) -> bool {
        !self.halted && self.epoch == epoch
    }
}

struct Shared {
    semaphore: Arc<Semaphore>,
    state: Mutex<QueueState>,
    events: mpsc::UnboundedSender<QueueEvent>,
    kill_timeout: Duration,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ResourceQueue {
    tx: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
}

impl ResourceQueue {
    /// Spawn the driver. Must be called inside a Tokio runtime.
    pub fn start(config: &ResourceQueueConfig, events: mpsc::UnboundedSender<QueueEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_phases.max(1))),
            state: Mutex::new(QueueState::default()),
            events,
            kill_timeout: config.kill_timeout(),
        });
        tokio::spawn(drive(rx, Arc::clone(&shared)));
        Self { tx, shared }
    }

    /// Hand a Queued phase to the executor.
    pub fn enqueue(&self, round: Arc<Round>, phase: PhaseType) -> Result<()> {
        let epoch = {
            let state = self.shared.state();
            if state.halted {
                return Err(RoundError::QueueHalted);
            }
            state.epoch
        };
        debug!(round_id = round.id(), %phase, "phase enqueued");
        self.tx
            .send(Request { round, phase, epoch })
            .map_err(|_| RoundError::QueueHalted)
    }

    /// Halt the queue and kill every in-flight graph, each within `timeout`.
    /// Queued requests are dropped, including after a later `reset`. A kill
    /// that times out is node-fatal.
    pub async fn kill(&self, timeout: Duration) -> Result<()> {
        let targets: Vec<_> = {
            let mut state = self.shared.state();
            state.halted = true;
            state.epoch += 1;
            state
                .in_flight
                .iter()
                .map(|((_, phase), round)| (Arc::clone(round), *phase))
                .collect()
        };

        let kills = targets.iter().map(|(round, phase)| async move {
            let p = round.phase(*phase)?;
            p.graph().kill(timeout).await.map_err(RoundError::from)
        });
        let failures: Vec<String> = futures::future::join_all(kills)
            .await
            .into_iter()
            .filter_map(|r| r.err().map(|e| e.to_string()))
            .collect();

        if failures.is_empty() {
            info!(killed = targets.len(), "resource queue killed");
            Ok(())
        } else {
            error!(failures = failures.len(), "resource queue kill timed out");
            Err(RoundError::NodeFatal(failures.join("; ")))
        }
    }

    /// Accept work again after a kill. Work queued before the kill stays
    /// dropped.
    pub fn reset(&self) {
        self.shared.state().halted = false;
        info!("resource queue reset");
    }

    pub fn is_halted(&self) -> bool {
        self.shared.state().halted
    }

    /// Phases currently executing.
    pub fn in_flight(&self) -> usize {
        self.shared.state().in_flight.len()
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

async fn drive(mut rx: mpsc::UnboundedReceiver<Request>, shared: Arc<Shared>) {
    while let Some(Request { round, phase, epoch }) = rx.recv().await {
        if !shared.state().accepts(epoch) {
            warn!(round_id = round.id(), %phase, "queue killed, dropping phase");
            continue;
        }
        let Ok(permit) = Arc::clone(&shared.semaphore).acquire_owned().await else {
            break;
        };

        // The check and the insert share the lock `kill` takes, so a phase
        // is either visible to the kill or never started.
        let key = (round.id(), phase);
        {
            let mut state = shared.state();
            if !state.accepts(epoch) {
                warn!(round_id = round.id(), %phase, "queue killed, dropping phase");
                continue;
            }
            state.in_flight.insert(key, Arc::clone(&round));
        }

        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _permit = permit;
            let event = match execute(&shared, &round, phase).await {
                Ok(Some(round_complete)) => QueueEvent::PhaseFinished {
                    round_id: round.id(),
                    phase,
                    round_complete,
                },
                Ok(None) => QueueEvent::AwaitingVerification {
                    round_id: round.id(),
                    phase,
                },
                Err(e) => {
                    warn!(round_id = round.id(), %phase, error = %e, "phase failed");
                    QueueEvent::Failed(RoundFailure::new(round.id(), Some(phase), e))
                }
            };
            shared.state().in_flight.remove(&key);
            let _ = shared.events.send(event);
        });
    }
    debug!("resource queue driver stopped");
}

/// Run one phase to the end of its transmission. `Some(complete)` when the
/// phase finished, `None` when it now waits for verification.
async fn execute(shared: &Shared, round: &Arc<Round>, phase: PhaseType) -> Result<Option<bool>> {
    let p = round.phase(phase)?;
    let graph = p.graph();
    round.start_phase(phase)?;
    let chunks = graph.chunk_done()?;
    graph.run()?;

    let transmit = p.transmitter().transmit(Arc::clone(round), phase, chunks);
    let outcome = tokio::time::timeout(p.timeout(), async {
        tokio::select! {
            r = transmit => r,
            failure = graph.failed() => Err(RoundError::Engine(EngineError::Worker(failure))),
        }
    })
    .await;

    let mut result = outcome.unwrap_or(Err(RoundError::Timeout {
        phase,
        after: p.timeout(),
    }));
    if result.is_ok() && graph.is_killed() {
        result = Err(RoundError::QueueHalted);
    }

    if let Err(e) = result {
        if let Err(kill) = graph.kill(shared.kill_timeout).await {
            return Err(RoundError::NodeFatal(format!("{e}; then {kill}")));
        }
        return Err(e);
    }

    if p.requires_verification() {
        debug!(round_id = round.id(), %phase, "phase awaiting verification");
        return Ok(None);
    }
    round.finish_phase(phase).map(Some)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;

    use mix_cryptops::CyclicGroup;
    use mix_engine::{Chunk, ChunkReceiver, GraphGenerator};
    use mix_types::{NodeId, Slot};

    use crate::phase::Phase;
    use crate::response::ResponseMap;
    use crate::round::RoundParams;
    use crate::streams::{decrypt, scripted, PhaseGraph};
    use crate::transmit::{DiscardHandler, TransmissionHandler};

    struct StallHandler;

    #[async_trait]
    impl TransmissionHandler for StallHandler {
        async fn transmit(
            &self,
            _round: Arc<Round>,
            _phase: PhaseType,
            _chunks: ChunkReceiver,
        ) -> Result<()> {
            std::future::pending().await
        }
    }

    fn gen() -> GraphGenerator {
        GraphGenerator::new(4, 1, 0, 0.0).unwrap()
    }

    fn solo_round(
        id: RoundId,
        graph: PhaseGraph,
        handler: Arc<dyn TransmissionHandler>,
        timeout: Duration,
    ) -> Arc<Round> {
        let phase = Phase::new(PhaseType::RealDecrypt, graph, handler, timeout, false);
        let params = RoundParams {
            id,
            batch_size: 4,
            topology: vec![NodeId::from("solo")],
            node_id: NodeId::from("solo"),
            grp: CyclicGroup::new((1u64 << 61) - 1, 37).unwrap(),
        };
        Arc::new(Round::new(params, vec![phase], ResponseMap::new()).unwrap())
    }

    fn feed(queue: &ResourceQueue, round: &Arc<Round>, mode: u64) {
        let graph = round.phase(PhaseType::RealDecrypt).unwrap().graph();
        graph.input(0, &Slot::new(mode)).unwrap();
        graph.send(Chunk::new(0, 4)).unwrap();
        assert!(round.queue_phase(PhaseType::RealDecrypt).unwrap());
        queue.enqueue(Arc::clone(round), PhaseType::RealDecrypt).unwrap();
    }

    fn queue(kill_timeout_ms: u64) -> (ResourceQueue, mpsc::UnboundedReceiver<QueueEvent>) {
        queue_with(2, kill_timeout_ms)
    }

    fn queue_with(
        max_concurrent_phases: usize,
        kill_timeout_ms: u64,
    ) -> (ResourceQueue, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ResourceQueueConfig {
            max_concurrent_phases,
            kill_timeout_ms,
        };
        (ResourceQueue::start(&config, tx), rx)
    }

    #[tokio::test]
    async fn finishes_a_phase() {
        let (q, mut events) = queue(1_000);
        let round = solo_round(
            1,
            decrypt::realtime_graph(&gen()),
            Arc::new(DiscardHandler),
            Duration::from_secs(5),
        );
        feed(&q, &round, 5);

        match events.recv().await.unwrap() {
            QueueEvent::PhaseFinished { round_id, round_complete, .. } => {
                assert_eq!(round_id, 1);
                assert!(round_complete);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(round.is_complete());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn adapter_failure_fails_the_round() {
        let (q, mut events) = queue(1_000);
        let round = solo_round(
            2,
            scripted::graph(&gen()),
            Arc::new(DiscardHandler),
            Duration::from_secs(5),
        );
        feed(&q, &round, scripted::FAIL);

        match events.recv().await.unwrap() {
            QueueEvent::Failed(failure) => {
                assert_eq!(failure.round_id, 2);
                assert!(matches!(failure.error, RoundError::Engine(EngineError::Worker(_))));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!round.is_complete());
    }

    #[tokio::test]
    async fn stalled_transmission_times_out() {
        let (q, mut events) = queue(1_000);
        let round = solo_round(
            3,
            decrypt::realtime_graph(&gen()),
            Arc::new(StallHandler),
            Duration::from_millis(50),
        );
        feed(&q, &round, 5);

        match events.recv().await.unwrap() {
            QueueEvent::Failed(failure) => {
                assert!(matches!(failure.error, RoundError::Timeout { .. }));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_with_hung_worker_is_fatal_and_halts() {
        let (q, _events) = queue(10_000);
        let round = solo_round(
            4,
            scripted::graph(&gen()),
            Arc::new(DiscardHandler),
            Duration::from_secs(30),
        );
        feed(&q, &round, scripted::HANG);

        while q.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = q.kill(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_node_fatal());
        assert!(q.is_halted());

        let other = solo_round(
            5,
            decrypt::realtime_graph(&gen()),
            Arc::new(DiscardHandler),
            Duration::from_secs(5),
        );
        assert!(matches!(
            q.enqueue(other, PhaseType::RealDecrypt),
            Err(RoundError::QueueHalted)
        ));

        scripted::RELEASE.store(true, Ordering::Release);
        q.reset();
        assert!(!q.is_halted());
    }

    #[tokio::test]
    async fn kill_idle_queue_succeeds() {
        let (q, _events) = queue(1_000);
        q.kill(Duration::from_millis(50)).await.unwrap();
        assert!(q.is_halted());
        q.reset();
        let round = solo_round(
            6,
            decrypt::realtime_graph(&gen()),
            Arc::new(DiscardHandler),
            Duration::from_secs(5),
        );
        assert!(q.enqueue(round, PhaseType::RealDecrypt).is_ok());
    }

    #[tokio::test]
    async fn work_queued_before_a_kill_never_runs() {
        let (q, mut events) = queue_with(1, 1_000);
        let busy = solo_round(
            7,
            decrypt::realtime_graph(&gen()),
            Arc::new(StallHandler),
            Duration::from_millis(300),
        );
        feed(&q, &busy, 5);
        while q.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Waits behind `busy` for the only permit.
        let stale = solo_round(
            8,
            decrypt::realtime_graph(&gen()),
            Arc::new(DiscardHandler),
            Duration::from_secs(5),
        );
        feed(&q, &stale, 5);

        q.kill(Duration::from_millis(500)).await.unwrap();
        q.reset();

        let fresh = solo_round(
            9,
            decrypt::realtime_graph(&gen()),
            Arc::new(DiscardHandler),
            Duration::from_secs(5),
        );
        feed(&q, &fresh, 5);

        match events.recv().await.unwrap() {
            QueueEvent::Failed(failure) => assert_eq!(failure.round_id, 7),
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await.unwrap() {
            QueueEvent::PhaseFinished { round_id, .. } => assert_eq!(round_id, 9),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!stale.is_complete());
        assert_eq!(
            stale.phase(PhaseType::RealDecrypt).unwrap().state(),
            mix_types::PhaseState::Queued
        );
        assert!(events.try_recv().is_err());
    }
}
