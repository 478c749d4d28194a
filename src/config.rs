//! Engine Configuration
//!
//! Loaded from YAML. Every field has a default, so an empty document is a
//! valid configuration.
//!
//! ```yaml
//! default_step_timeout_secs: 1800
//! execution_retention_secs: 600
//! tombstone_retention_secs: 3600
//! queue:
//!   visibility_timeout_secs: 120
//!   max_retries: 3
//! resource_constraints:
//!   - name: cluster-x
//!     capacity: 1
//!     strategy: PRIORITY
//! state_dir: /var/lib/deployflow
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sync::constraint::ConstraintConfig;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a lease stays valid before the event may be re-leased
    pub visibility_timeout_secs: u64,
    /// Re-deliveries allowed before an event is parked
    pub max_retries: u32,
    /// Idle delay between lease attempts of a worker
    pub poll_interval_ms: u64,
    /// Delay before a nacked event becomes leasable again
    pub retry_backoff_secs: u64,
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 300,
            max_retries: 5,
            poll_interval_ms: 1000,
            retry_backoff_secs: 30,
            workers: num_cpus::get(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for asynchronous step responses when a state sets none
    pub default_step_timeout_secs: u64,
    /// How long a settled execution stays in memory before only the store
    /// has it
    pub execution_retention_secs: u64,
    /// How long resolved correlation ids keep rejecting late notifications
    pub tombstone_retention_secs: u64,
    pub queue: QueueConfig,
    pub resource_constraints: Vec<ConstraintConfig>,
    /// Directory for the JSON state store; in-memory when unset
    pub state_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: 3600,
            execution_retention_secs: 600,
            tombstone_retention_secs: 3600,
            queue: QueueConfig::default(),
            resource_constraints: Vec::new(),
            state_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config = Self::from_yaml(&contents)?;
        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    pub fn execution_retention(&self) -> Duration {
        Duration::from_secs(self.execution_retention_secs)
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_secs)
    }

    pub fn with_retention(mut self, executions: Duration, tombstones: Duration) -> Self {
        self.execution_retention_secs = executions.as_secs();
        self.tombstone_retention_secs = tombstones.as_secs();
        self
    }

    pub fn with_constraint(mut self, constraint: ConstraintConfig) -> Self {
        self.resource_constraints.push(constraint);
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }
}
