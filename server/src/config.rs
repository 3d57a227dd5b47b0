//! Tunable constants of the prediction system

use shared::{
    HISTORY_CAPACITY, MAX_INPUT_OVERFLOW_MS, MAX_INPUT_UNDERFLOW_MS, RENDER_DELAY_MS,
    REPLICATION_INTERVAL_MS,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("history capacity must be at least 1")]
    ZeroHistoryCapacity,
    #[error("replication interval must be at least 1 ms")]
    ZeroReplicationInterval,
}

/// Timing and buffering parameters shared by every part of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictionConfig {
    /// States retained per entity before the oldest is evicted.
    pub history_capacity: usize,
    pub replication_interval_ms: u64,
    pub render_delay_ms: u64,
    /// Inputs stamped further than this ahead of the server clock are dropped.
    pub max_input_overflow_ms: u64,
    /// Entities silent for longer than this are advanced with an idle input.
    pub max_input_underflow_ms: u64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            history_capacity: HISTORY_CAPACITY,
            replication_interval_ms: REPLICATION_INTERVAL_MS,
            render_delay_ms: RENDER_DELAY_MS,
            max_input_overflow_ms: MAX_INPUT_OVERFLOW_MS,
            max_input_underflow_ms: MAX_INPUT_UNDERFLOW_MS,
        }
    }
}

impl PredictionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::ZeroHistoryCapacity);
        }
        if self.replication_interval_ms == 0 {
            return Err(ConfigError::ZeroReplicationInterval);
        }
        Ok(())
    }
}
