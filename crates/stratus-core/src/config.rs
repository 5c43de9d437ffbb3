//! stratus.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ControlPlaneConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub health: HealthClientConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub autoscale: AutoscaleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Identifier this control-plane node uses on the bus.
    pub node_id: String,
    pub data_dir: PathBuf,
    pub self_check_interval_secs: u64,
    pub bus: BusTransport,
    /// Listen address with `bus = "listen"`, server address with `bus = "connect"`.
    pub bus_addr: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_id: "stratus-0".to_string(),
            data_dir: PathBuf::from("/var/lib/stratus"),
            self_check_interval_secs: 60,
            bus: BusTransport::Listen,
            bus_addr: "127.0.0.1:4222".to_string(),
        }
    }
}

/// How the daemon reaches compute nodes, stagers and the health-signal subsystem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusTransport {
    /// In-process only. Nothing outside the daemon can reach it.
    Local,
    /// Serve the bus over TCP at `bus_addr`.
    #[default]
    Listen,
    /// Join the bus served by another process at `bus_addr`.
    Connect,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long an instance or node record stays live without a refresh.
    pub ttl_secs: u64,
    /// Stats sweep period; must be shorter than `ttl_secs`.
    pub sweep_interval_secs: u64,
    pub stats_timeout_ms: u64,
    /// Timeout for the "who are you" request sent to unseen nodes.
    pub identify_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            sweep_interval_secs: 20,
            stats_timeout_ms: 2_000,
            identify_timeout_ms: 2_000,
        }
    }
}

impl LedgerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stats_timeout(&self) -> Duration {
        Duration::from_millis(self.stats_timeout_ms)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthClientConfig {
    /// Timeout applied to health and status queries.
    pub query_timeout_ms: u64,
}

impl Default for HealthClientConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 2_000,
        }
    }
}

impl HealthClientConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StagingConfig {
    /// Retries after the first attempt when no stager has capacity.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// How long a single staging request may take.
    pub stage_timeout_secs: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay_ms: 3_000,
            stage_timeout_secs: 900,
        }
    }
}

impl StagingConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoscaleConfig {
    /// Whether a scale-up policy is configured at all.
    pub enabled: bool,
    /// Minimum gap between two scale-ups of the same application.
    pub cooldown_secs: u64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: 60,
        }
    }
}

impl ControlPlaneConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ControlPlaneConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Startup-time checks on relationships the individual fields can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ledger = &self.ledger;
        if ledger.ttl_secs == 0 {
            return Err(ConfigError::Zero("ledger.ttl_secs"));
        }
        if ledger.sweep_interval_secs == 0 {
            return Err(ConfigError::Zero("ledger.sweep_interval_secs"));
        }
        if ledger.sweep_interval_secs >= ledger.ttl_secs {
            return Err(ConfigError::SweepNotShorterThanTtl {
                sweep_secs: ledger.sweep_interval_secs,
                ttl_secs: ledger.ttl_secs,
            });
        }
        if ledger.stats_timeout_ms == 0 {
            return Err(ConfigError::Zero("ledger.stats_timeout_ms"));
        }
        if ledger.identify_timeout_ms == 0 {
            return Err(ConfigError::Zero("ledger.identify_timeout_ms"));
        }
        if self.health.query_timeout_ms == 0 {
            return Err(ConfigError::Zero("health.query_timeout_ms"));
        }
        if self.staging.stage_timeout_secs == 0 {
            return Err(ConfigError::Zero("staging.stage_timeout_secs"));
        }
        if self.daemon.self_check_interval_secs == 0 {
            return Err(ConfigError::Zero("daemon.self_check_interval_secs"));
        }
        if self.daemon.bus != BusTransport::Local && self.daemon.bus_addr.trim().is_empty() {
            return Err(ConfigError::MissingBusAddress(self.daemon.bus));
        }
        Ok(())
    }
}
