//! Synchronization configuration.
//!
//! [`SyncConfig`] sizes the history buffers and the client's replay window.
//! It deserializes from JSON with every field optional:
//!
//! ```
//! use rewind_engine::config::SyncConfig;
//!
//! let config = SyncConfig::from_json(r#"{ "client_buffer_size": 16 }"#).unwrap();
//! assert_eq!(config.client_buffer_size, 16);
//! assert_eq!(config.state_buffer_size, 8);
//! assert_eq!(config.requested_depth(), 12);
//! ```

use serde::{Deserialize, Serialize};

use rewind_ecs::buffer::DEFAULT_BUFFER_SIZE;

use crate::SyncError;

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

/// Buffer sizes and seeds for one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Snapshots retained by the state history.
    pub state_buffer_size: usize,
    /// Tick batches retained by the action history.
    pub action_buffer_size: usize,
    /// History depth a client keeps for rollback and replay.
    pub client_buffer_size: usize,
    /// Ticks of slack the client keeps back when asking the server for a
    /// replay depth.
    pub buffer_request_margin: usize,
    /// Seed for the entity id generator.
    pub hash_seed: u64,
}

impl Default for SyncConfig {
    /// Eight ticks of history, a twelve-tick client window asking for eight.
    fn default() -> Self {
        Self {
            state_buffer_size: DEFAULT_BUFFER_SIZE,
            action_buffer_size: DEFAULT_BUFFER_SIZE,
            client_buffer_size: 12,
            buffer_request_margin: 4,
            hash_seed: 0,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the sync layer cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.state_buffer_size == 0 {
            return Err(SyncError::Config {
                reason: "state_buffer_size must be at least 1".to_owned(),
            });
        }
        if self.action_buffer_size == 0 {
            return Err(SyncError::Config {
                reason: "action_buffer_size must be at least 1".to_owned(),
            });
        }
        if self.buffer_request_margin >= self.client_buffer_size {
            return Err(SyncError::Config {
                reason: format!(
                    "buffer_request_margin ({}) must be smaller than client_buffer_size ({})",
                    self.buffer_request_margin, self.client_buffer_size
                ),
            });
        }
        Ok(())
    }

    /// Depth a client requests from the server in its BUFFER message.
    pub fn requested_depth(&self) -> usize {
        self.client_buffer_size - self.buffer_request_margin
    }
}
