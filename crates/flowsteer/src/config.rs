//! Runtime configuration.
//!
//! Loaded from an optional YAML file; every field has a default so an
//! empty file (or no file) is valid. Command-line flags override the file.
//!
//! ```yaml
//! tools:
//!   ethtool: /usr/sbin/ethtool
//! lock_dir: /run/flowsteer
//! add_policy: fail_fast
//! vf_poll:
//!   attempts: 10
//!   initial_backoff_ms: 100
//!   max_backoff_ms: 2000
//! tuning:
//!   combined_channels: 4
//!   rx_usecs: 0
//!   adaptive_rx: false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flowsteer_common::{shell, Coalesce, ToolPaths};

use crate::error::{FlowsteerError, FlowsteerResult};

/// What to do when the device rejects a rule addition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddPolicy {
    /// Stop at the first rejection; remaining ports are reported failed.
    #[default]
    FailFast,
    /// Attempt every port regardless of earlier rejections.
    BestEffort,
}

/// External tool locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ethtool: String,
    pub ip: String,
    pub tc: String,
    pub sysfs_root: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ethtool: shell::ETHTOOL_CMD.to_string(),
            ip: shell::IP_CMD.to_string(),
            tc: shell::TC_CMD.to_string(),
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

impl From<&ToolsConfig> for ToolPaths {
    fn from(t: &ToolsConfig) -> Self {
        ToolPaths {
            ethtool: t.ethtool.clone(),
            ip: t.ip.clone(),
            tc: t.tc.clone(),
            sysfs_root: t.sysfs_root.clone(),
        }
    }
}

/// Bounded backoff used while waiting for VF interfaces to appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfPollConfig {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for VfPollConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
        }
    }
}

impl VfPollConfig {
    /// Delay before poll `attempt` (0-based): doubles from the initial
    /// backoff, capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Queue/interrupt tuning passed through to the driver verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub combined_channels: Option<u32>,
    pub rx_ring: Option<u32>,
    pub rx_usecs: Option<u32>,
    pub adaptive_rx: Option<bool>,
}

impl TuningConfig {
    pub fn coalesce(&self) -> Coalesce {
        Coalesce {
            rx_usecs: self.rx_usecs,
            adaptive_rx: self.adaptive_rx,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.combined_channels.is_none() && self.rx_ring.is_none() && self.coalesce().is_empty()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowsteerConfig {
    pub tools: ToolsConfig,
    /// Directory for per-interface lock files.
    pub lock_dir: PathBuf,
    /// Directory for per-interface ownership ledgers.
    pub state_dir: PathBuf,
    pub add_policy: AddPolicy,
    pub vf_poll: VfPollConfig,
    pub tuning: TuningConfig,
}

impl Default for FlowsteerConfig {
    fn default() -> Self {
        Self {
            tools: ToolsConfig::default(),
            lock_dir: PathBuf::from("/run/flowsteer"),
            state_dir: PathBuf::from("/var/lib/flowsteer"),
            add_policy: AddPolicy::default(),
            vf_poll: VfPollConfig::default(),
            tuning: TuningConfig::default(),
        }
    }
}

impl FlowsteerConfig {
    /// Parses configuration from YAML text.
    pub fn from_yaml(text: &str) -> FlowsteerResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| FlowsteerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> FlowsteerResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FlowsteerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> FlowsteerResult<()> {
        if self.vf_poll.attempts == 0 {
            return Err(FlowsteerError::Config(
                "vf_poll.attempts must be at least 1".to_string(),
            ));
        }
        if self.vf_poll.initial_backoff_ms > self.vf_poll.max_backoff_ms {
            return Err(FlowsteerError::Config(format!(
                "vf_poll.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.vf_poll.initial_backoff_ms, self.vf_poll.max_backoff_ms
            )));
        }
        if self.tuning.combined_channels == Some(0) {
            return Err(FlowsteerError::Config(
                "tuning.combined_channels must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
