//! One running mix node.
//!
//! ```text
//!   inbox ──▶ decode ──▶ StartRound     create_round (inline, keeps order)
//!                        PostPhase      await_gate ──▶ input + send ──▶ queue
//!                        PostNewBatch   first node's RealDecrypt
//!                        RoundError     halt on the peer's report
//!
//!   ResourceQueue events ──▶ PhaseFinished(PrecompReveal) ──▶ Standby
//!                            PhaseFinished(complete)      ──▶ retire, Completed
//!                            Failed                       ──▶ report_round_failure
//! ```
//!
//! Activity follows the round: Waiting → Precomputing on StartRound, Standby
//! once precomputation is done, Realtime when the batch arrives, Completed
//! when the last phase finishes.
//!
//! A round failure is terminal for the node. A local failure is broadcast to
//! the rest of the topology; a failure a peer reports is not sent on. Either
//! way the report is persisted as it was built, every graph is killed and
//! the node stops taking work.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mix_cryptops::CyclicGroup;
use mix_engine::{Chunk, GraphGenerator, StreamError};
use mix_round::failure::{clear_report, persist_report, read_report};
use mix_round::protocol::{build_phases, build_responses};
use mix_round::{
    decode_message, Phase, Position, QueueEvent, ResourceQueue, Result, Round, RoundError,
    RoundFailure, RoundManager, RoundParams,
};
use mix_types::config::NodeConfig;
use mix_types::{
    Activity, NodeId, PhaseState, PhaseTag, PhaseType, RoundErrorReport, RoundId, RoundMessage,
    Slot, Topology,
};

use crate::activity::ActivityMachine;
use crate::handlers::{CompletedBatch, HandlerSet};
use crate::network::PeerNetwork;

// ── Node instance ────────────────────────────────────────────────────────────

pub struct NodeInstance {
    id: NodeId,
    config: NodeConfig,
    grp: CyclicGroup,
    generator: GraphGenerator,
    rounds: RoundManager,
    queue: ResourceQueue,
    network: Arc<dyn PeerNetwork>,
    handlers: HandlerSet,
    activity: ActivityMachine,
    recovered_error: Option<RoundErrorReport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeInstance {
    /// Validate `config`, pick up any error report a previous run left
    /// behind, and spawn the inbox and queue-event loops.
    pub fn start(
        id: NodeId,
        config: NodeConfig,
        network: Arc<dyn PeerNetwork>,
        inbox: mpsc::Receiver<Vec<u8>>,
        completed: mpsc::UnboundedSender<CompletedBatch>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let grp = CyclicGroup::from_config(&config.group)?;
        let generator = GraphGenerator::from_config(&config.graph)?;

        let recovered_error = match read_report(&config.error_output_path) {
            Ok(Some(report)) => {
                warn!(
                    node = %id,
                    round_id = report.round_id,
                    error = %report.error,
                    at = %report.timestamp,
                    "recovered error from previous run"
                );
                Some(report)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(node = %id, error = %e, "unreadable error report, discarding");
                None
            }
        };
        clear_report(&config.error_output_path)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let queue = ResourceQueue::start(&config.queue, events_tx);
        let handlers = HandlerSet::new(Arc::clone(&network), completed);

        let node = Arc::new(Self {
            id,
            config,
            grp,
            generator,
            rounds: RoundManager::new(),
            queue,
            network,
            handlers,
            activity: ActivityMachine::new(),
            recovered_error,
            tasks: Mutex::new(Vec::new()),
        });

        let events = tokio::spawn(event_loop(Arc::downgrade(&node), events_rx));
        let messages = tokio::spawn(inbox_loop(Arc::downgrade(&node), inbox));
        node.lock_tasks().extend([events, messages]);
        node.activity.enter(Activity::Waiting)?;

        info!(node = %node.id, "node started");
        Ok(node)
    }

    // ── Rounds ───────────────────────────────────────────────────────────

    /// Build every phase for this node's position, register the round and
    /// start precomputation. Waits for the previous round to complete.
    pub async fn create_round(
        &self,
        round_id: RoundId,
        batch_size: u32,
        topology: Vec<NodeId>,
    ) -> Result<Arc<Round>> {
        self.ensure_active()?;
        let position = Topology::new(topology.clone())
            .map(|t| Position::of(&t, &self.id))
            .map_err(|e| RoundError::InvalidTopology(e.to_string()))?;
        if self.rounds.contains(round_id) || self.rounds.is_retired(round_id) {
            return Err(RoundError::DuplicateRound(round_id));
        }

        let ready = [Activity::Waiting, Activity::Completed];
        let gate = self.config.round.gate_timeout();
        if self.activity.wait_for(&ready, gate).await? == Activity::Completed {
            self.activity.enter(Activity::Waiting)?;
        }

        let phases = build_phases(
            &self.generator,
            position,
            &self.handlers,
            self.config.round.phase_timeout(),
        )?;
        let params = RoundParams {
            id: round_id,
            batch_size,
            topology,
            node_id: self.id.clone(),
            grp: self.grp,
        };
        let round = Round::new(params, phases, build_responses(position))?;
        let round = self.rounds.add(round)?;
        self.activity.enter(Activity::Precomputing)?;

        // Generation takes no wire input; one chunk over the whole batch
        // starts it.
        let generation = round.phase(PhaseType::PrecompGeneration)?;
        generation.graph().send(Chunk::new(0, batch_size))?;
        self.enqueue_if_ready(&round, PhaseType::PrecompGeneration)?;

        info!(node = %self.id, round_id, batch_size, ?position, "round started");
        Ok(round)
    }

    fn enqueue_if_ready(&self, round: &Arc<Round>, phase: PhaseType) -> Result<()> {
        if round.queue_phase(phase)? {
            self.queue.enqueue(Arc::clone(round), phase)?;
        }
        Ok(())
    }

    /// Store `slots` at `begin..` of `phase` and hand the range to its graph.
    fn feed_phase(
        &self,
        round: &Arc<Round>,
        phase: &Phase,
        begin: u32,
        slots: &[Slot],
    ) -> Result<()> {
        if slots.is_empty() {
            return Ok(());
        }
        let graph = phase.graph();
        let len = graph.batch_size();
        let end = u32::try_from(slots.len())
            .ok()
            .and_then(|n| begin.checked_add(n))
            .filter(|&end| end <= len)
            .ok_or(StreamError::OutsideOfBatch { index: begin, len })?;

        for (index, slot) in (begin..end).zip(slots) {
            match graph.input(index, slot) {
                Ok(()) => {}
                // Slot keeps its previous value.
                Err(StreamError::OutsideOfGroup { index }) => warn!(
                    round_id = round.id(),
                    phase = %phase.phase_type(),
                    index,
                    "slot outside of group, skipped"
                ),
                Err(e) => return Err(e.into()),
            }
        }
        graph.send(Chunk::new(begin, end))?;
        self.enqueue_if_ready(round, phase.phase_type())
    }

    /// Route a `PostPhase` through the round's response table. Messages that
    /// arrive before their phase is reachable wait at the gate.
    pub async fn post_phase(
        &self,
        round_id: RoundId,
        tag: &PhaseTag,
        from: &NodeId,
        begin: u32,
        slots: &[Slot],
    ) -> Result<()> {
        self.ensure_active()?;
        let round = self.rounds.get(round_id)?;
        let phase = round.await_gate(tag, self.config.round.gate_timeout()).await?;
        debug!(
            node = %self.id,
            round_id,
            %tag,
            %from,
            begin,
            slots = slots.len(),
            target = %phase.phase_type(),
            "post phase"
        );

        if !tag.verification {
            if !phase.phase_type().is_precomputation() {
                self.enter_realtime().await?;
            }
            return self.feed_phase(&round, phase, begin, slots);
        }

        let key = slots
            .first()
            .ok_or_else(|| RoundError::InvalidRound(format!("{tag} carries no key")))?;
        round.buffer().set_cypher_public_key(key.payload);
        round.verify_phase(phase.phase_type())?;

        // Precomputation decryption starts from the identity on the first
        // node.
        if round.is_first_node() {
            let decrypt = round.phase(PhaseType::PrecompDecrypt)?;
            let ones = vec![Slot::new(1); round.batch_size() as usize];
            self.feed_phase(&round, decrypt, 0, &ones)?;
        }
        Ok(())
    }

    /// Realtime input from a predecessor. Its Standby may still be in the
    /// event queue, so wait for it.
    async fn enter_realtime(&self) -> Result<()> {
        let expected = [Activity::Standby, Activity::Realtime];
        self.activity
            .wait_for(&expected, self.config.round.gate_timeout())
            .await?;
        self.activity.enter(Activity::Realtime)
    }

    /// Client payloads for the realtime half. Only the first node takes them,
    /// only in Standby with its RealDecrypt Available, and only a full batch.
    pub fn post_new_batch(&self, round_id: RoundId, slots: &[Slot]) -> Result<()> {
        self.ensure_active()?;
        self.activity.require(&[Activity::Standby])?;
        let round = self.rounds.get(round_id)?;
        if !round.is_first_node() {
            return Err(RoundError::InvalidRound(format!(
                "{} is not the first node of round {round_id}",
                self.id
            )));
        }
        let phase = round.phase(PhaseType::RealDecrypt)?;
        let state = phase.state();
        if state != PhaseState::Available {
            return Err(RoundError::UnexpectedState {
                tag: "PostNewBatch".into(),
                phase: PhaseType::RealDecrypt,
                state,
                expected: vec![PhaseState::Available],
            });
        }
        if slots.len() != round.batch_size() as usize {
            return Err(RoundError::InvalidRound(format!(
                "batch of {} slots, round {round_id} takes {}",
                slots.len(),
                round.batch_size()
            )));
        }
        self.activity.enter(Activity::Realtime)?;
        info!(node = %self.id, round_id, slots = slots.len(), "new batch");
        self.feed_phase(&round, phase, 0, slots)
    }

    /// Wait until `phase` of a live round reaches at least `state`.
    pub async fn await_phase(
        &self,
        round_id: RoundId,
        phase: PhaseType,
        state: PhaseState,
        timeout: Duration,
    ) -> Result<()> {
        let round = self.rounds.get(round_id)?;
        let target = round.phase(phase)?;
        let mut rx = round.subscribe();
        let reached = async {
            loop {
                let _ = rx.borrow_and_update();
                if target.state() >= state {
                    return;
                }
                if rx.changed().await.is_err() {
                    return std::future::pending().await;
                }
            }
        };
        tokio::time::timeout(timeout, reached)
            .await
            .map_err(|_| RoundError::Timeout { phase, after: timeout })
    }

    /// Wait until the node's activity is one of `expected`.
    pub async fn await_activity(
        &self,
        expected: &[Activity],
        timeout: Duration,
    ) -> Result<Activity> {
        self.activity.wait_for(expected, timeout).await
    }

    // ── Failure ──────────────────────────────────────────────────────────

    /// A peer reported a failure. Only rounds this node still runs are
    /// affected; the report is kept as the peer built it and not sent on.
    pub async fn handle_peer_error(&self, report: RoundErrorReport) {
        if !self.rounds.contains(report.round_id) {
            debug!(
                node = %self.id,
                round_id = report.round_id,
                peer = %report.node_id,
                "peer error for a round not running here, ignored"
            );
            return;
        }
        if !self.activity.fail() {
            debug!(node = %self.id, round_id = report.round_id, "already in error");
            return;
        }
        warn!(
            node = %self.id,
            round_id = report.round_id,
            peer = %report.node_id,
            phase = ?report.phase,
            error = %report.error,
            "peer failed round"
        );
        self.halt(&report).await;
    }

    /// Broadcast, persist, kill, and move to the terminal error state. Only
    /// the first failure is reported.
    pub async fn report_round_failure(&self, failure: RoundFailure) {
        if !self.activity.fail() {
            debug!(
                node = %self.id,
                round_id = failure.round_id,
                error = %failure.error,
                "already in error"
            );
            return;
        }
        if failure.error.is_node_fatal() {
            self.activity.crash();
        }
        let report = failure.report(&self.id);
        error!(
            node = %self.id,
            round_id = failure.round_id,
            phase = ?failure.phase,
            error = %failure.error,
            "round failed"
        );

        let peers: Vec<NodeId> = self
            .rounds
            .get(failure.round_id)
            .map(|r| r.topology().iter().filter(|n| **n != self.id).cloned().collect())
            .unwrap_or_default();
        let msg = RoundMessage::RoundError(report.clone());
        let sends = join_all(peers.iter().map(|p| self.network.send(p, &msg)));
        match tokio::time::timeout(self.config.round.error_broadcast_timeout(), sends).await {
            Ok(results) => {
                for (peer, r) in peers.iter().zip(results) {
                    if let Err(e) = r {
                        warn!(node = %self.id, %peer, error = %e, "round error not delivered");
                    }
                }
            }
            Err(_) => {
                warn!(node = %self.id, peers = peers.len(), "round error broadcast timed out");
            }
        }

        self.halt(&report).await;
    }

    /// Persist `report` and kill everything. Called once, after the node
    /// entered Error.
    async fn halt(&self, report: &RoundErrorReport) {
        if let Err(e) = persist_report(&self.config.error_output_path, report) {
            error!(node = %self.id, error = %e, "could not persist round error");
        }

        let kill_timeout = self.config.queue.kill_timeout();
        if let Err(e) = self.queue.kill(kill_timeout).await {
            error!(node = %self.id, error = %e, "resource queue kill failed");
            self.activity.crash();
        }
        for round_id in self.rounds.round_ids() {
            if let Some(round) = self.rounds.remove(round_id) {
                if let Err(e) = round.kill(kill_timeout).await {
                    error!(node = %self.id, round_id, error = %e, "round kill failed");
                }
            }
        }
        info!(node = %self.id, activity = %self.activity(), "node halted");
    }

    /// Precomputation of the running round is done.
    fn precomputation_done(&self, round_id: RoundId) -> Result<()> {
        self.activity.enter(Activity::Standby)?;
        info!(node = %self.id, round_id, "standby");
        Ok(())
    }

    fn complete_round(&self, round_id: RoundId) -> Result<()> {
        let Some(round) = self.rounds.remove(round_id) else {
            return Ok(());
        };
        for phase in round.phases() {
            let elapsed = phase
                .metrics()
                .elapsed("Queued", "Finished")
                .map(|d| d.num_milliseconds());
            debug!(round_id, phase = %phase.phase_type(), elapsed_ms = ?elapsed, "phase timing");
        }
        let total = round
            .metrics()
            .elapsed("Created", "Completed")
            .map(|d| d.num_milliseconds());
        info!(node = %self.id, round_id, elapsed_ms = ?total, "round complete");
        self.activity.enter(Activity::Completed)
    }

    // ── Message dispatch ─────────────────────────────────────────────────

    async fn handle_message(&self, msg: RoundMessage) {
        let round_id = msg.round_id();
        let kind = msg.kind();
        let phase = match &msg {
            RoundMessage::PostPhase { tag, .. } => Some(tag.phase),
            RoundMessage::PostNewBatch { .. } => Some(PhaseType::RealDecrypt),
            _ => None,
        };

        let result = match msg {
            RoundMessage::StartRound {
                round_id,
                batch_size,
                topology,
            } => self
                .create_round(round_id, batch_size, topology)
                .await
                .map(|_| ()),
            RoundMessage::PostPhase {
                round_id,
                tag,
                from,
                begin,
                slots,
            } => self.post_phase(round_id, &tag, &from, begin, &slots).await,
            RoundMessage::PostNewBatch { round_id, slots } => {
                self.post_new_batch(round_id, &slots)
            }
            RoundMessage::RoundError(report) => {
                self.handle_peer_error(report).await;
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(RoundError::UnknownRound(_)) => {
                debug!(node = %self.id, round_id, kind, "message for unknown round dropped");
            }
            Err(e) if self.activity().is_failed() => {
                debug!(node = %self.id, round_id, kind, error = %e, "node in error, dropped");
            }
            Err(e) => {
                self.report_round_failure(RoundFailure::new(round_id, phase, e))
                    .await;
            }
        }
    }

    // ── Status ───────────────────────────────────────────────────────────

    fn ensure_active(&self) -> Result<()> {
        let current = self.activity();
        if current.is_failed() {
            return Err(RoundError::NodeFatal(format!("{} is in {current}", self.id)));
        }
        Ok(())
    }

    pub fn activity(&self) -> Activity {
        self.activity.current()
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The report a previous run left at the error path, if any.
    pub fn recovered_error(&self) -> Option<&RoundErrorReport> {
        self.recovered_error.as_ref()
    }

    pub fn rounds(&self) -> &RoundManager {
        &self.rounds
    }

    /// Stop the loops and kill whatever is still running.
    pub async fn shutdown(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        if let Err(e) = self.queue.kill(self.config.queue.kill_timeout()).await {
            warn!(node = %self.id, error = %e, "kill on shutdown failed");
        }
        info!(node = %self.id, "node stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Background loops ─────────────────────────────────────────────────────────

async fn inbox_loop(node: Weak<NodeInstance>, mut inbox: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = inbox.recv().await {
        let Some(node) = node.upgrade() else {
            break;
        };
        let msg = match decode_message(&data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(node = %node.id, error = %e, "undecodable message dropped");
                continue;
            }
        };
        match msg {
            // Rounds must exist before any of their phase traffic is handled.
            RoundMessage::StartRound { .. } => node.handle_message(msg).await,
            other => {
                tokio::spawn(async move { node.handle_message(other).await });
            }
        }
    }
    debug!("inbox closed");
}

async fn event_loop(node: Weak<NodeInstance>, mut events: mpsc::UnboundedReceiver<QueueEvent>) {
    while let Some(event) = events.recv().await {
        let Some(node) = node.upgrade() else {
            break;
        };
        let moved = match event {
            QueueEvent::PhaseFinished {
                round_id,
                phase,
                round_complete: true,
            } => node.complete_round(round_id).map_err(|e| (round_id, phase, e)),
            QueueEvent::PhaseFinished { round_id, phase, .. }
                if phase == PhaseType::LAST_PRECOMPUTATION =>
            {
                node.precomputation_done(round_id)
                    .map_err(|e| (round_id, phase, e))
            }
            QueueEvent::PhaseFinished { round_id, phase, .. } => {
                debug!(node = %node.id, round_id, %phase, "phase done");
                Ok(())
            }
            QueueEvent::AwaitingVerification { round_id, phase } => {
                debug!(node = %node.id, round_id, %phase, "awaiting verification");
                Ok(())
            }
            QueueEvent::Failed(failure) => {
                node.report_round_failure(failure).await;
                Ok(())
            }
        };
        if let Err((round_id, phase, e)) = moved {
            node.report_round_failure(RoundFailure::new(round_id, Some(phase), e))
                .await;
        }
    }
    debug!("queue events closed");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
