//! Pool configuration: environment variables in, a validated `PoolConfig` out.
//!
//! Mirrors the teacher's section-per-concern config struct (one `Default` impl
//! per section) but loads from the process environment instead of a TOML
//! file, per spec §6 ("Configuration variables consumed").

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest and largest accepted pool size (spec §3).
pub const MIN_POOL_SIZE: u32 = 1;
pub const MAX_POOL_SIZE: u32 = 100;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("POOL_SIZE must be in {MIN_POOL_SIZE}..={MAX_POOL_SIZE}, got {0}")]
    PoolSizeOutOfRange(u32),
    #[error("SOCKS port range [{socks_base}, {socks_base}+{size}) overlaps control port range [{ctrl_base}, {ctrl_base}+{size})")]
    PortRangesOverlap {
        socks_base: u16,
        ctrl_base: u16,
        size: u32,
    },
    #[error("ALERT_NODE_DOWN_THRESHOLD must be in 0.0..=1.0, got {0}")]
    AlertThresholdOutOfRange(f64),
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Immutable pool configuration (spec §3, "Pool configuration").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    pub pool_size: u32,
    pub base_socks_port: u16,
    pub base_ctrl_port: u16,
    pub data_dir: String,
    /// Relay binary invoked per spec §6 ("Spawned child process"); overridable
    /// for tests via `RELAY_BINARY`.
    pub relay_binary: String,
    pub countries: Vec<String>,
    pub strict_nodes: bool,
    pub auto_rotate_enabled: bool,
    pub auto_rotate_interval: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub max_failed_checks: u32,
    pub alert_node_down_threshold: f64,
    /// `Tb` — bootstrap timeout (spec §3, default 60s).
    pub bootstrap_timeout: Duration,
    /// Deadline carried by every control-protocol session (spec §5, default 5s).
    pub control_session_timeout: Duration,
    /// Graceful shutdown window before a forced kill (spec §4.D, default 10s).
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            base_socks_port: 30000,
            base_ctrl_port: 40000,
            data_dir: "/var/lib/relaypool".to_string(),
            relay_binary: "relay".to_string(),
            countries: Vec::new(),
            strict_nodes: false,
            auto_rotate_enabled: false,
            auto_rotate_interval: Duration::from_secs(600),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            max_failed_checks: 3,
            alert_node_down_threshold: 0.5,
            bootstrap_timeout: Duration::from_secs(60),
            control_session_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    /// Load from the process environment, falling back to defaults for
    /// anything unset. Does not validate — call [`PoolConfig::validate`]
    /// before handing this to the supervisor.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_var("POOL_SIZE") {
            config.pool_size = parse_env("POOL_SIZE", &v)?;
        }
        if let Some(v) = env_var("BASE_SOCKS_PORT") {
            config.base_socks_port = parse_env("BASE_SOCKS_PORT", &v)?;
        }
        if let Some(v) = env_var("BASE_CTRL_PORT") {
            config.base_ctrl_port = parse_env("BASE_CTRL_PORT", &v)?;
        }
        if let Some(v) = env_var("DATA_DIR") {
            config.data_dir = v;
        }
        if let Some(v) = env_var("RELAY_BINARY") {
            config.relay_binary = v;
        }
        if let Some(v) = env_var("COUNTRIES") {
            config.countries = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = env_var("STRICT_NODES") {
            config.strict_nodes = parse_bool("STRICT_NODES", &v)?;
        }
        if let Some(v) = env_var("AUTO_ROTATE_ENABLED") {
            config.auto_rotate_enabled = parse_bool("AUTO_ROTATE_ENABLED", &v)?;
        }
        if let Some(v) = env_var("AUTO_ROTATE_INTERVAL") {
            config.auto_rotate_interval = Duration::from_secs(parse_env("AUTO_ROTATE_INTERVAL", &v)?);
        }
        if let Some(v) = env_var("HEALTH_CHECK_INTERVAL") {
            config.health_check_interval = Duration::from_secs(parse_env("HEALTH_CHECK_INTERVAL", &v)?);
        }
        if let Some(v) = env_var("HEALTH_CHECK_TIMEOUT") {
            config.health_check_timeout = Duration::from_secs(parse_env("HEALTH_CHECK_TIMEOUT", &v)?);
        }
        if let Some(v) = env_var("MAX_FAILED_CHECKS") {
            config.max_failed_checks = parse_env("MAX_FAILED_CHECKS", &v)?;
        }
        if let Some(v) = env_var("ALERT_NODE_DOWN_THRESHOLD") {
            config.alert_node_down_threshold = parse_env("ALERT_NODE_DOWN_THRESHOLD", &v)?;
        }

        Ok(config)
    }

    /// Validate port-range disjointness, pool-size bounds, and threshold
    /// bounds (spec §3, §4.A). Invoked once at supervisor construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&self.pool_size) {
            return Err(ConfigError::PoolSizeOutOfRange(self.pool_size));
        }

        let socks_base = self.base_socks_port as u32;
        let ctrl_base = self.base_ctrl_port as u32;
        let size = self.pool_size;
        let ranges_disjoint = socks_base + size <= ctrl_base || ctrl_base + size <= socks_base;
        if !ranges_disjoint {
            return Err(ConfigError::PortRangesOverlap {
                socks_base: self.base_socks_port,
                ctrl_base: self.base_ctrl_port,
                size,
            });
        }

        if !(0.0..=1.0).contains(&self.alert_node_down_threshold) {
            return Err(ConfigError::AlertThresholdOutOfRange(
                self.alert_node_down_threshold,
            ));
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
    }
}
