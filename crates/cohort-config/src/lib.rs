//! Configuration management for Cohort
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (COHORT_* prefix, `__` between section and key)
//! 2. cohort.local.toml (gitignored, local overrides)
//! 3. cohort.toml (git-tracked, project config)
//! 4. ~/.config/cohort/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! CLI arguments are applied on top by the binary.

use anyhow::Result;
use cohort_types::{ProcessId, find_duplicate};
use serde::{Deserialize, Serialize};
use std::path::Path;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Cohort configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortConfig {
    pub node: NodeConfig,
    pub group: GroupConfig,
    pub transport: TransportSettings,
    pub fifo: FifoSettings,
    pub causal: CausalSettings,
    pub runtime: RuntimeSettings,
}

/// Identity of the local process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub address: String,
    /// Port 0 binds an ephemeral port.
    pub port: u16,
    /// Bump on every restart so peers never confuse two epochs.
    pub incarnation: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 7400,
            incarnation: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Initial view, as `host:port:incarnation`. Empty means a group of one.
    pub members: Vec<String>,
    /// Start without a view and wait for a state transfer from a member.
    pub join: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub max_frame_size: usize,
    pub buffer_size: usize,
    pub nodelay: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            buffer_size: 64 * 1024,
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FifoSettings {
    /// Unbounded when absent.
    pub max_buffered_per_source: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CausalSettings {
    pub max_outstanding: usize,
    pub early_ack_capacity: usize,
}

impl Default for CausalSettings {
    fn default() -> Self {
        Self {
            max_outstanding: 1024,
            early_ack_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub command_queue_capacity: usize,
    pub poll_interval_ms: u64,
    /// How often view members without a connection are redialed.
    pub reconnect_interval_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            command_queue_capacity: 1024,
            poll_interval_ms: 100,
            reconnect_interval_ms: 1000,
        }
    }
}

impl CohortConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// The local process identity.
    pub fn local_pid(&self) -> ProcessId {
        ProcessId::new(
            self.node.address.clone(),
            self.node.port,
            self.node.incarnation,
        )
    }

    /// The parsed initial view.
    ///
    /// Empty when joining. An empty member list otherwise means a group of
    /// just the local process.
    pub fn initial_members(&self) -> Result<Vec<ProcessId>, ConfigError> {
        if self.group.join {
            return Ok(Vec::new());
        }
        if self.group.members.is_empty() {
            return Ok(vec![self.local_pid()]);
        }
        self.group
            .members
            .iter()
            .map(|value| {
                value
                    .parse::<ProcessId>()
                    .map_err(|source| ConfigError::InvalidProcessId {
                        value: value.clone(),
                        source,
                    })
            })
            .collect()
    }

    /// Checks cross-field constraints the types cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.address.is_empty() {
            return Err(ConfigError::ValidationError(
                "node.address must not be empty".to_string(),
            ));
        }

        let members = self.initial_members()?;
        if let Some(pid) = find_duplicate(&members) {
            return Err(ConfigError::ValidationError(format!(
                "group.members lists {pid} twice"
            )));
        }
        if !self.group.join && !members.contains(&self.local_pid()) {
            return Err(ConfigError::ValidationError(format!(
                "group.members must include the local process {}",
                self.local_pid()
            )));
        }

        let positive = [
            ("transport.max_frame_size", self.transport.max_frame_size),
            ("causal.max_outstanding", self.causal.max_outstanding),
            ("causal.early_ack_capacity", self.causal.early_ack_capacity),
            (
                "runtime.command_queue_capacity",
                self.runtime.command_queue_capacity,
            ),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{key} must be greater than zero"
                )));
            }
        }
        if u32::try_from(self.transport.max_frame_size).is_err() {
            return Err(ConfigError::ValidationError(
                "transport.max_frame_size must fit in a u32 length prefix".to_string(),
            ));
        }
        if self.fifo.max_buffered_per_source == Some(0) {
            return Err(ConfigError::ValidationError(
                "fifo.max_buffered_per_source must be greater than zero when set".to_string(),
            ));
        }
        if self.runtime.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.runtime.reconnect_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.reconnect_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Renders the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
