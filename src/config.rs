//! Worker and registry configuration.
//!
//! Configuration is immutable once a registry is built; every worker shares it
//! through an `Arc`. It can be constructed in code or loaded from YAML:
//!
//! ```rust
//! use flowstitch::WorkerConfig;
//!
//! let config = WorkerConfig::from_yaml_str("hex_dump: true\nmax_idle_ticks: 20\n").unwrap();
//! assert!(config.hex_dump);
//! assert_eq!(config.queue_capacity, 16);
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::{ReassemblyError, Result};

/// Inbound queue length per worker
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Timer period of every worker
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;

/// Consecutive idle ticks before a worker is evicted (10 x 100ms = 1s)
pub const DEFAULT_MAX_IDLE_TICKS: u32 = 10;

/// Lifecycle events buffered per registry subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Capacity of each worker's inbound fragment queue
    pub queue_capacity: usize,

    /// Period of the idle timer in milliseconds
    pub tick_interval_ms: u64,

    /// Number of idle ticks after which a flow is flushed and evicted
    pub max_idle_ticks: u32,

    /// Render message bodies as a hex dump
    pub hex_dump: bool,

    /// Buffer size of the registry's lifecycle event channel
    pub event_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_idle_ticks: DEFAULT_MAX_IDLE_TICKS,
            hex_dump: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl WorkerConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: WorkerConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading worker configuration from {}", path.display());
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| ReassemblyError::file_error(path.to_path_buf(), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Enable or disable hex-dump rendering
    pub fn with_hex_dump(mut self, hex_dump: bool) -> Self {
        self.hex_dump = hex_dump;
        self
    }

    /// Override the idle timer
    pub fn with_idle_timeout(mut self, tick_interval: Duration, max_idle_ticks: u32) -> Self {
        self.tick_interval_ms = u64::try_from(tick_interval.as_millis()).unwrap_or(u64::MAX);
        self.max_idle_ticks = max_idle_ticks;
        self
    }

    /// Override the inbound queue length
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Silence after which a flow is evicted
    pub fn idle_timeout(&self) -> Duration {
        self.tick_interval().saturating_mul(self.max_idle_ticks)
    }

    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(ReassemblyError::config_error("queue_capacity must be greater than zero"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ReassemblyError::config_error("tick_interval_ms must be greater than zero"));
        }
        if self.max_idle_ticks == 0 {
            return Err(ReassemblyError::config_error("max_idle_ticks must be greater than zero"));
        }
        if self.event_capacity == 0 {
            return Err(ReassemblyError::config_error("event_capacity must be greater than zero"));
        }
        Ok(())
    }
}
