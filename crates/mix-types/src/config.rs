// Node configuration. Every section has defaults so a partial JSON file is
// enough; `validate` runs after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MixError, Result};

/// Upper bound on worker threads per module.
pub const MAX_THREADS: u8 = 64;

/// Output size of 0 means "same as the minimum input size".
pub const AUTO_OUTPUT_SIZE: u32 = 0;

// ── Node ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub group: GroupConfig,
    pub graph: GraphGenConfig,
    pub queue: ResourceQueueConfig,
    pub round: RoundConfig,

    /// Where the last unrecoverable round error is written.
    pub error_output_path: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            group: GroupConfig::default(),
            graph: GraphGenConfig::default(),
            queue: ResourceQueueConfig::default(),
            round: RoundConfig::default(),
            error_output_path: PathBuf::from("round-error.json"),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| MixError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| MixError::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.group.validate()?;
        self.graph.validate()?;
        self.queue.validate()?;
        self.round.validate()?;
        if self.error_output_path.as_os_str().is_empty() {
            return Err(MixError::Config("error_output_path must be set".into()));
        }
        Ok(())
    }
}

// ── Group ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Prime modulus. Must stay below 2^63 so products fit in u128 comfortably.
    pub prime: u64,
    pub generator: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            prime: (1u64 << 61) - 1,
            generator: 37,
        }
    }
}

impl GroupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.prime < 5 || self.prime >= 1u64 << 63 {
            return Err(MixError::Config(format!("group prime {} out of range", self.prime)));
        }
        if self.generator <= 1 || self.generator >= self.prime {
            return Err(MixError::Config(format!(
                "generator {} must lie in (1, prime)",
                self.generator
            )));
        }
        Ok(())
    }
}

// ── Graph generation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphGenConfig {
    /// Smallest chunk any module receives; also the batch expansion floor.
    pub min_input_size: u32,

    /// Workers per module when a module does not pin its own count.
    pub default_num_threads: u8,

    /// Granularity of egress notifications. 0 = `min_input_size`.
    pub output_size: u32,

    /// Fraction of the batch that must be done before egress starts.
    pub output_threshold: f32,
}

impl Default for GraphGenConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_THREADS as usize);
        Self {
            min_input_size: 4,
            default_num_threads: cpus as u8,
            output_size: AUTO_OUTPUT_SIZE,
            output_threshold: 0.0,
        }
    }
}

impl GraphGenConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_input_size == 0 {
            return Err(MixError::Config("min_input_size must be > 0".into()));
        }
        if self.default_num_threads == 0 || self.default_num_threads > MAX_THREADS {
            return Err(MixError::Config(format!(
                "default_num_threads must be in 1..={MAX_THREADS}, got {}",
                self.default_num_threads
            )));
        }
        if !(0.0..=1.0).contains(&self.output_threshold) {
            return Err(MixError::Config(format!(
                "output_threshold must be in [0, 1], got {}",
                self.output_threshold
            )));
        }
        Ok(())
    }

    pub fn resolved_output_size(&self) -> u32 {
        if self.output_size == AUTO_OUTPUT_SIZE {
            self.min_input_size
        } else {
            self.output_size
        }
    }
}

// ── Resource queue ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceQueueConfig {
    /// Phases allowed to execute at once across all rounds.
    pub max_concurrent_phases: usize,

    /// Bound on a cooperative graph kill.
    pub kill_timeout_ms: u64,
}

impl Default for ResourceQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_phases: 4,
            kill_timeout_ms: 5_000,
        }
    }
}

impl ResourceQueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_phases == 0 {
            return Err(MixError::Config("max_concurrent_phases must be > 0".into()));
        }
        Ok(())
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

// ── Round ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Budget for one phase from Running to the end of transmission.
    pub phase_timeout_ms: u64,

    /// How long an early message may wait for its phase to become reachable.
    pub gate_timeout_ms: u64,

    /// Bound on broadcasting a round error to the rest of the topology.
    pub error_broadcast_timeout_ms: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            phase_timeout_ms: 60_000,
            gate_timeout_ms: 30_000,
            error_broadcast_timeout_ms: 180_000,
        }
    }
}

impl RoundConfig {
    pub fn validate(&self) -> Result<()> {
        if self.phase_timeout_ms == 0 {
            return Err(MixError::Config("phase_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_timeout_ms)
    }

    pub fn error_broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.error_broadcast_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = NodeConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.graph.min_input_size, 4);
        assert_eq!(cfg.graph.resolved_output_size(), 4);
        assert!(cfg.graph.default_num_threads >= 1);
        assert!(cfg.graph.default_num_threads <= MAX_THREADS);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: NodeConfig =
            serde_json::from_str(r#"{ "queue": { "max_concurrent_phases": 2 } }"#).unwrap();
        assert_eq!(cfg.queue.max_concurrent_phases, 2);
        assert_eq!(cfg.queue.kill_timeout_ms, 5_000);
        assert_eq!(cfg.round.error_broadcast_timeout(), Duration::from_secs(180));
    }

    #[test]
    fn rejects_bad_graph_settings() {
        let mut cfg = NodeConfig::default();
        cfg.graph.default_num_threads = 65;
        assert!(matches!(cfg.validate(), Err(MixError::Config(_))));

        let mut cfg = NodeConfig::default();
        cfg.graph.output_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = NodeConfig::default();
        cfg.graph.min_input_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_group() {
        let mut cfg = NodeConfig::default();
        cfg.group.generator = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let mut cfg = NodeConfig::default();
        cfg.round.phase_timeout_ms = 1_234;
        std::fs::write(&path, cfg.to_json_pretty().unwrap()).unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.round.phase_timeout_ms, 1_234);
    }
}
