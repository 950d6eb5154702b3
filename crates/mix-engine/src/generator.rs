use mix_types::config::{GraphGenConfig, AUTO_OUTPUT_SIZE, MAX_THREADS};

use crate::error::{EngineError, Result};
use crate::graph::Graph;
use crate::stream::Stream;

/// Stamps node-wide graph parameters into every graph it creates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphGenerator {
    min_input_size: u32,
    default_num_threads: u8,
    output_size: u32,
    output_threshold: f32,
}

impl GraphGenerator {
    /// `output_size` of [`AUTO_OUTPUT_SIZE`] follows `min_input_size`.
    pub fn new(
        min_input_size: u32,
        default_num_threads: u8,
        output_size: u32,
        output_threshold: f32,
    ) -> Result<Self> {
        if min_input_size == 0 {
            return Err(EngineError::InvalidGenerator("min input size must be > 0".into()));
        }
        if default_num_threads == 0 || default_num_threads > MAX_THREADS {
            return Err(EngineError::InvalidGenerator(format!(
                "default thread count {default_num_threads} outside 1..={MAX_THREADS}"
            )));
        }
        let output_size = if output_size == AUTO_OUTPUT_SIZE {
            min_input_size
        } else {
            output_size
        };
        if output_size % min_input_size != 0 && min_input_size % output_size != 0 {
            return Err(EngineError::InvalidGenerator(format!(
                "output size {output_size} incompatible with min input size {min_input_size}"
            )));
        }
        if !(0.0..=1.0).contains(&output_threshold) {
            return Err(EngineError::InvalidGenerator(format!(
                "output threshold {output_threshold} outside [0, 1]"
            )));
        }
        Ok(Self {
            min_input_size,
            default_num_threads,
            output_size,
            output_threshold,
        })
    }

    pub fn from_config(config: &GraphGenConfig) -> Result<Self> {
        Self::new(
            config.min_input_size,
            config.default_num_threads,
            config.output_size,
            config.output_threshold,
        )
    }

    /// Same parameters with a different egress threshold. Permutation graphs
    /// use 1.0: their output positions are only final once every input is.
    pub fn with_output_threshold(&self, threshold: f32) -> Result<Self> {
        Self::new(
            self.min_input_size,
            self.default_num_threads,
            self.output_size,
            threshold,
        )
    }

    pub fn new_graph<S: Stream>(&self, name: impl Into<String>) -> Graph<S> {
        Graph::new(name.into(), *self)
    }

    pub fn min_input_size(&self) -> u32 {
        self.min_input_size
    }

    pub fn default_num_threads(&self) -> u8 {
        self.default_num_threads
    }

    pub fn output_size(&self) -> u32 {
        self.output_size
    }

    pub fn output_threshold(&self) -> f32 {
        self.output_threshold
    }
}
