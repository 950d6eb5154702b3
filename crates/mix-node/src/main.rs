//! mix-node binary: local cluster simulator and config tooling.
//!
//! ```bash
//! # Three nodes, two rounds of eight messages each
//! RUST_LOG=info cargo run --bin mix-node -- simulate --nodes 3 --batch-size 8 --rounds 2
//!
//! # Validate a config file, or print the defaults to start one
//! cargo run --bin mix-node -- check-config node.json
//! cargo run --bin mix-node -- default-config > node.json
//! ```

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mix_node::Cluster;
use mix_types::config::NodeConfig;
use mix_types::Slot;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "mix-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Precomputation mix network node"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an in-process cluster and mix random batches through it.
    Simulate {
        #[arg(long, default_value_t = 3)]
        nodes: usize,

        #[arg(long, default_value_t = 8)]
        batch_size: u32,

        #[arg(long, default_value_t = 1)]
        rounds: u64,

        /// JSON node config; defaults apply to missing fields.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print completed batches as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Validate a JSON node config.
    CheckConfig { path: PathBuf },

    /// Print the default config as JSON.
    DefaultConfig,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Simulate { nodes, batch_size, rounds, config, json } => {
            let config = match config {
                Some(path) => NodeConfig::from_file(&path)?,
                None       => NodeConfig::default(),
            };
            tokio::select! {
                r = simulate(nodes, batch_size, rounds, config, json) => r,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Ctrl-C, abandoning simulation");
                    Ok(())
                }
            }
        }
        Command::CheckConfig { path } => {
            NodeConfig::from_file(&path)?;
            println!("{}: ok", path.display());
            Ok(())
        }
        Command::DefaultConfig => {
            println!("{}", NodeConfig::default().to_json_pretty()?);
            Ok(())
        }
    }
}

// ── Simulate ──────────────────────────────────────────────────────────────────

async fn simulate(
    nodes: usize,
    batch_size: u32,
    rounds: u64,
    config: NodeConfig,
    json: bool,
) -> Result<()> {
    if batch_size == 0 {
        bail!("batch size must be > 0");
    }
    let timeout = config.round.phase_timeout() * 6;
    let prime = config.group.prime;
    let mut cluster = Cluster::start(nodes, &config)?;
    info!(nodes, batch_size, rounds, "simulation starting");

    for round_id in 1..=rounds {
        let input = random_batch(batch_size, prime);

        let started = std::time::Instant::now();
        let batch = cluster.run_round(round_id, input.clone(), timeout).await?;
        let elapsed = started.elapsed();

        let mut sent: Vec<u64> = input.iter().map(|s| s.payload).collect();
        let mut mixed: Vec<u64> = batch.slots.iter().map(|s| s.payload).collect();
        sent.sort_unstable();
        mixed.sort_unstable();
        if sent != mixed {
            bail!("round {round_id}: output is not a permutation of the input");
        }

        if json {
            let out = serde_json::json!({
                "round_id": round_id,
                "elapsed_ms": elapsed.as_millis() as u64,
                "slots": batch.slots.iter().map(|s| s.payload).collect::<Vec<_>>(),
            });
            println!("{out}");
        } else {
            println!("round {round_id}: {} slots mixed in {elapsed:?}", batch.slots.len());
            for (i, slot) in batch.slots.iter().enumerate() {
                println!("  [{i:>4}] {}", slot.payload);
            }
        }
    }

    cluster.shutdown().await;
    info!("simulation done");
    Ok(())
}

fn random_batch(batch_size: u32, prime: u64) -> Vec<Slot> {
    let mut rng = rand::thread_rng();
    (0..batch_size)
        .map(|_| Slot::new(rng.gen_range(2..prime)))
        .collect()
}
