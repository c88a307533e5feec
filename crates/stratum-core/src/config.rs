use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const TRANSPORT_ENV: &str = "STRATUM_TRANSPORT";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub layers: LayerConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default = "default_statistics_window")]
    pub statistics_window: usize,
    #[serde(default = "default_log_tag")]
    pub log_tag: String,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            statistics_window: default_statistics_window(),
            log_tag: default_log_tag(),
        }
    }
}

fn default_statistics_window() -> usize {
    1000
}
fn default_log_tag() -> String {
    "LAYER".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default)]
    pub enabled: bool,
    pub transport: Option<String>,
    /// Forwarding handles kept for remote layers; the oldest is dropped
    /// once the limit is reached.
    #[serde(default = "default_remote_handle_capacity")]
    pub remote_handle_capacity: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            transport: None,
            remote_handle_capacity: default_remote_handle_capacity(),
        }
    }
}

fn default_remote_handle_capacity() -> usize {
    256
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_guest_session_name")]
    pub guest_session_name: String,
    #[serde(default = "default_system_session_name")]
    pub system_session_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            guest_session_name: default_guest_session_name(),
            system_session_name: default_system_session_name(),
        }
    }
}

fn default_guest_session_name() -> String {
    "Guest".into()
}
fn default_system_session_name() -> String {
    "System".into()
}

impl RuntimeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STRATUM_TRANSPORT`, which names the transport and enables the
    /// bridge.
    pub fn with_env_overrides(self) -> Self {
        self.with_transport_override(std::env::var(TRANSPORT_ENV).ok())
    }

    fn with_transport_override(mut self, transport: Option<String>) -> Self {
        if let Some(name) = transport.filter(|n| !n.trim().is_empty()) {
            self.distributed.enabled = true;
            self.distributed.transport = Some(name);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.layers.statistics_window == 0 {
            return Err(ConfigError::Invalid {
                key: "layers.statistics_window",
                reason: "must be at least 1".into(),
            });
        }
        if self.distributed.remote_handle_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "distributed.remote_handle_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.service.guest_session_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "service.guest_session_name",
                reason: "must not be empty".into(),
            });
        }
        if self.service.system_session_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "service.system_session_name",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}
