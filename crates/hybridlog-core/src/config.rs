//! Configuration management for HybridLog
//!
//! Provides hardware-class presets and `with_*` helpers for custom
//! configurations. `Config` derives serde so a host can embed it in its own
//! configuration file; missing fields fall back to the server preset.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HybridError, HybridResult};

/// Hard ceiling for key length: the record header stores it as a u16.
pub const KEY_SIZE_CEILING: usize = u16::MAX as usize;

/// Hard ceiling for value length.
pub const VALUE_SIZE_CEILING: usize = 512 * 1024 * 1024;

/// HybridLog configuration with hardware presets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of concurrently live sessions per engine instance
    pub session_capacity: usize,
    /// Primary log segment rotation threshold (bytes)
    pub log_segment_size: u64,
    /// Object log segment rotation threshold (bytes)
    pub object_segment_size: u64,
    /// Values longer than this are written to the object log
    pub inline_value_limit: usize,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// Durable sync after every log append instead of only at checkpoints
    pub durable_writes: bool,
    /// On open, replay log records written after the latest checkpoint
    pub recover_log_tail: bool,
    /// Purge older checkpoints (not held by a snapshot) after each new one.
    /// When off, explicit checkpoints accumulate; dispose checkpoints still
    /// replace the previous dispose checkpoint.
    pub remove_outdated: bool,
    /// Background fold-over checkpoint cadence; `None` disables the checkpointer
    pub checkpoint_interval: Option<Duration>,
}

impl Config {
    /// Server-class: large segments, wide session pool
    pub fn server() -> Self {
        Self {
            session_capacity: 120,
            log_segment_size: 256 * 1024 * 1024,
            object_segment_size: 1024 * 1024 * 1024,
            inline_value_limit: 64 * 1024,
            max_key_size: 1024,
            max_value_size: 64 * 1024 * 1024,
            durable_writes: false,
            recover_log_tail: true,
            remove_outdated: false,
            checkpoint_interval: None,
        }
    }

    /// Workstation-class: developer machines and local nodes
    pub fn workstation() -> Self {
        Self {
            session_capacity: 32,
            log_segment_size: 64 * 1024 * 1024,
            object_segment_size: 256 * 1024 * 1024,
            inline_value_limit: 16 * 1024,
            max_key_size: 1024,
            max_value_size: 32 * 1024 * 1024,
            durable_writes: false,
            recover_log_tail: true,
            remove_outdated: true,
            checkpoint_interval: Some(Duration::from_secs(60)),
        }
    }

    /// Constrained-class: small devices, every write synced
    pub fn constrained() -> Self {
        Self {
            session_capacity: 4,
            log_segment_size: 16 * 1024 * 1024,
            object_segment_size: 64 * 1024 * 1024,
            inline_value_limit: 4 * 1024,
            max_key_size: 256,
            max_value_size: 8 * 1024 * 1024,
            durable_writes: true,
            recover_log_tail: true,
            remove_outdated: true,
            checkpoint_interval: Some(Duration::from_secs(120)),
        }
    }

    pub fn with_session_capacity(mut self, capacity: usize) -> Self {
        self.session_capacity = capacity;
        self
    }

    pub fn with_inline_value_limit(mut self, limit: usize) -> Self {
        self.inline_value_limit = limit;
        self
    }

    pub fn with_durable_writes(mut self, durable: bool) -> Self {
        self.durable_writes = durable;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Option<Duration>) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_remove_outdated(mut self, remove: bool) -> Self {
        self.remove_outdated = remove;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> HybridResult<()> {
        let invalid = |msg: &str| Err(HybridError::InvalidConfig(msg.to_string()));

        if self.session_capacity == 0 {
            return invalid("session_capacity must be > 0");
        }
        if self.log_segment_size < 64 * 1024 {
            return invalid("log_segment_size must be >= 64KB");
        }
        if self.object_segment_size < 64 * 1024 {
            return invalid("object_segment_size must be >= 64KB");
        }
        if self.max_key_size == 0 || self.max_key_size > KEY_SIZE_CEILING {
            return invalid("max_key_size must be in [1, 65535]");
        }
        if self.max_value_size == 0 || self.max_value_size > VALUE_SIZE_CEILING {
            return invalid("max_value_size must be in [1, 512MB]");
        }
        if self.inline_value_limit > self.max_value_size {
            return invalid("inline_value_limit must be <= max_value_size");
        }
        if let Some(interval) = self.checkpoint_interval {
            if interval.as_millis() == 0 {
                return invalid("checkpoint_interval must be > 0");
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::server()
    }
}
