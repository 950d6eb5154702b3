//! In-process cluster: N nodes over one [`LocalNetwork`], driven the way a
//! scheduler would drive a real deployment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use mix_types::config::NodeConfig;
use mix_types::{Activity, NodeId, PhaseState, PhaseType, RoundId, RoundMessage, Slot};

use crate::handlers::CompletedBatch;
use crate::instance::NodeInstance;
use crate::network::{LocalNetwork, PeerNetwork};

pub struct Cluster {
    network: LocalNetwork,
    nodes: Vec<Arc<NodeInstance>>,
    completed: mpsc::UnboundedReceiver<CompletedBatch>,
}

/// `round-error.json` → `round-error-n1.json` for node `n1`.
fn node_error_path(base: &Path, id: &NodeId) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "round-error".into());
    let name = match base.extension() {
        Some(ext) => format!("{stem}-{id}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{id}"),
    };
    base.with_file_name(name)
}

impl Cluster {
    /// Start `n` nodes named `n0..n{n-1}`, each with its own error path
    /// derived from `base.error_output_path`.
    pub fn start(n: usize, base: &NodeConfig) -> Result<Self> {
        if n == 0 {
            bail!("a cluster needs at least one node");
        }
        let network = LocalNetwork::new();
        let (completed_tx, completed) = mpsc::unbounded_channel();

        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let id = NodeId::new(format!("n{i}"));
            let mut config = base.clone();
            config.error_output_path = node_error_path(&base.error_output_path, &id);
            let inbox = network.register(id.clone());
            let node = NodeInstance::start(
                id.clone(),
                config,
                Arc::new(network.clone()),
                inbox,
                completed_tx.clone(),
            )
            .with_context(|| format!("starting node {id}"))?;
            nodes.push(node);
        }
        info!(nodes = n, "cluster started");
        Ok(Self {
            network,
            nodes,
            completed,
        })
    }

    pub fn nodes(&self) -> &[Arc<NodeInstance>] {
        &self.nodes
    }

    pub fn topology(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id().clone()).collect()
    }

    fn first(&self) -> Result<&Arc<NodeInstance>> {
        self.nodes.first().context("cluster has no nodes")
    }

    /// Send StartRound to every node, last first, so a node's successor
    /// already knows the round when the first phase output arrives.
    pub async fn start_round(&self, round_id: RoundId, batch_size: u32) -> Result<()> {
        let msg = RoundMessage::StartRound {
            round_id,
            batch_size,
            topology: self.topology(),
        };
        for node in self.nodes.iter().rev() {
            self.network.send(node.id(), &msg).await?;
        }
        Ok(())
    }

    /// Wait until precomputation is done and the first node is in Standby,
    /// the only activity in which it takes a batch.
    pub async fn await_ready(&self, round_id: RoundId, timeout: Duration) -> Result<()> {
        let first = self.first()?;
        let deadline = tokio::time::Instant::now() + timeout;
        // StartRound is delivered through the inbox; the round may not exist yet.
        while !first.rounds().contains(round_id) {
            if tokio::time::Instant::now() >= deadline {
                bail!("round {round_id} never started on {}", first.id());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        first
            .await_phase(round_id, PhaseType::RealDecrypt, PhaseState::Available, left)
            .await
            .with_context(|| format!("round {round_id} precomputation"))?;
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        first
            .await_activity(&[Activity::Standby], left)
            .await
            .with_context(|| format!("round {round_id} standby on {}", first.id()))?;
        Ok(())
    }

    pub async fn post_batch(&self, round_id: RoundId, slots: Vec<Slot>) -> Result<()> {
        let first = self.first()?;
        let msg = RoundMessage::PostNewBatch { round_id, slots };
        self.network.send(first.id(), &msg).await?;
        Ok(())
    }

    pub async fn next_completed(&mut self, timeout: Duration) -> Result<CompletedBatch> {
        match tokio::time::timeout(timeout, self.completed.recv()).await {
            Ok(Some(batch)) => Ok(batch),
            Ok(None) => bail!("completed batch channel closed"),
            Err(_) => bail!("no completed batch within {timeout:?}"),
        }
    }

    /// One full round: precomputation, then `slots` through realtime.
    pub async fn run_round(
        &mut self,
        round_id: RoundId,
        slots: Vec<Slot>,
        timeout: Duration,
    ) -> Result<CompletedBatch> {
        let batch_size = u32::try_from(slots.len()).context("batch too large")?;
        self.start_round(round_id, batch_size).await?;
        self.await_ready(round_id, timeout).await?;
        self.post_batch(round_id, slots).await?;
        let batch = self.next_completed(timeout).await?;
        if batch.round_id != round_id {
            bail!("expected round {round_id}, got {}", batch.round_id);
        }
        Ok(batch)
    }

    /// Poll until every node is in `Error` or `Crash`, or `timeout` passes.
    pub async fn await_all_errored(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.nodes.iter().all(|n| n.activity().is_failed()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await;
            self.network.unregister(node.id());
        }
        info!("cluster stopped");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
