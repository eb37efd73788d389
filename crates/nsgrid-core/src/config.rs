//! nsgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::duration::parse_duration;
use crate::types::PORTS_PER_BLOCK;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("port range {start}+{size} does not fit in 1..=65535")]
    PortRangeOverflow { start: u16, size: u32 },

    #[error("port range of {0} ports holds no complete port block")]
    PortRangeTooSmall(u32),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("service {0} has an empty command")]
    EmptyCommand(&'static str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NsgridConfig {
    pub server: ServerConfig,
    pub ports: PortsConfig,
    pub provisioning: ProvisioningConfig,
    pub data: DataConfig,
    pub services: ServicesConfig,
    pub dns: DnsConfig,
    pub default_cluster: DefaultClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Prefix for `poll_url`. Empty means relative URLs.
    pub public_url: String,
    /// Bearer token accepted for operator endpoints.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7400".to_string(),
            public_url: String::new(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub range_start: u16,
    pub range_size: u32,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: 10000,
            range_size: 100,
        }
    }
}

impl PortsConfig {
    /// Number of whole blocks in the range.
    pub fn capacity(&self) -> u32 {
        self.range_size / u32::from(PORTS_PER_BLOCK)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub deadline: String,
    pub startup_window: String,
    pub probe_interval: String,
    pub probe_timeout: String,
    pub liveness_interval: String,
    pub unhealthy_threshold: u32,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            deadline: "10m".to_string(),
            startup_window: "30s".to_string(),
            probe_interval: "2s".to_string(),
            probe_timeout: "2s".to_string(),
            liveness_interval: "15s".to_string(),
            unhealthy_threshold: 3,
        }
    }
}

/// Parsed form of [`ProvisioningConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningTimings {
    pub deadline: Duration,
    pub startup_window: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub liveness_interval: Duration,
    pub unhealthy_threshold: u32,
}

impl ProvisioningConfig {
    pub fn timings(&self) -> Result<ProvisioningTimings, ConfigError> {
        let field = |name: &'static str, value: &str| {
            parse_duration(value).ok_or_else(|| ConfigError::Duration {
                field: name,
                value: value.to_string(),
            })
        };
        Ok(ProvisioningTimings {
            deadline: field("deadline", &self.deadline)?,
            startup_window: field("startup_window", &self.startup_window)?,
            probe_interval: field("probe_interval", &self.probe_interval)?,
            probe_timeout: field("probe_timeout", &self.probe_timeout)?,
            liveness_interval: field("liveness_interval", &self.liveness_interval)?,
            unhealthy_threshold: self.unhealthy_threshold.max(1),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub root: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/nsgrid"),
        }
    }
}

impl DataConfig {
    pub fn registry_path(&self) -> PathBuf {
        self.root.join("nsgrid.redb")
    }

    pub fn namespaces_dir(&self) -> PathBuf {
        self.root.join("namespaces")
    }
}

/// How to start one child service.
///
/// `args` and `env` values are templated with `{namespace}`, `{data_dir}`,
/// `{host}`, `{sql_http_port}`, `{sql_raft_port}`, `{cache_http_port}`,
/// `{cache_memberlist_port}`, `{gateway_port}`, `{sql_url}` and `{cache_url}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Address child services bind to.
    pub host: String,
    pub sql: ServiceCommand,
    pub cache: ServiceCommand,
    pub gateway: ServiceCommand,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            sql: ServiceCommand {
                command: "rqlited".to_string(),
                args: strings(&[
                    "-node-id",
                    "{namespace}-sql",
                    "-http-addr",
                    "{host}:{sql_http_port}",
                    "-raft-addr",
                    "{host}:{sql_raft_port}",
                    "{data_dir}",
                ]),
                health_path: "/readyz".to_string(),
                env: HashMap::new(),
            },
            cache: ServiceCommand {
                command: "olricd".to_string(),
                args: strings(&[
                    "-bind-addr",
                    "{host}",
                    "-http-port",
                    "{cache_http_port}",
                    "-memberlist-port",
                    "{cache_memberlist_port}",
                    "-data-dir",
                    "{data_dir}",
                ]),
                health_path: "/health".to_string(),
                env: HashMap::new(),
            },
            gateway: ServiceCommand {
                command: "nsgrid-gateway".to_string(),
                args: strings(&[
                    "--namespace",
                    "{namespace}",
                    "--listen",
                    "{host}:{gateway_port}",
                    "--sql-url",
                    "{sql_url}",
                    "--cache-url",
                    "{cache_url}",
                    "--data-dir",
                    "{data_dir}",
                ]),
                health_path: "/v1/health".to_string(),
                env: HashMap::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsMode {
    /// The route is treated as published as soon as it is asked about.
    #[default]
    Assume,
    /// Resolve `{namespace}.{base_domain}`.
    Resolve,
    /// An external publisher flips the flag through the API.
    Manual,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub mode: DnsMode,
    pub base_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultClusterConfig {
    pub sql_url: String,
    pub cache_url: String,
    pub gateway_url: String,
}

impl Default for DefaultClusterConfig {
    fn default() -> Self {
        Self {
            sql_url: "http://127.0.0.1:4001".to_string(),
            cache_url: "http://127.0.0.1:3320".to_string(),
            gateway_url: "http://127.0.0.1:6001".to_string(),
        }
    }
}

impl NsgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NsgridConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let end = u32::from(self.ports.range_start) + self.ports.range_size;
        if self.ports.range_start == 0 || end > u32::from(u16::MAX) + 1 {
            return Err(ConfigError::PortRangeOverflow {
                start: self.ports.range_start,
                size: self.ports.range_size,
            });
        }
        if self.ports.capacity() == 0 {
            return Err(ConfigError::PortRangeTooSmall(self.ports.range_size));
        }
        self.provisioning.timings()?;
        for (name, svc) in [
            ("sql", &self.services.sql),
            ("cache", &self.services.cache),
            ("gateway", &self.services.gateway),
        ] {
            if svc.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NsgridConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ports.capacity(), 20);
        let timings = config.provisioning.timings().unwrap();
        assert_eq!(timings.deadline, Duration::from_secs(600));
        assert_eq!(timings.startup_window, Duration::from_secs(30));
    }

    #[test]
    fn parse_minimal() {
        let toml_str = r#"
[ports]
range_start = 20000
range_size = 52

[provisioning]
deadline = "90s"
"#;
        let config: NsgridConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.ports.range_start, 20000);
        assert_eq!(config.ports.capacity(), 10);
        assert_eq!(
            config.provisioning.timings().unwrap().deadline,
            Duration::from_secs(90)
        );
        assert_eq!(config.services.sql.command, "rqlited");
    }

    #[test]
    fn parse_service_override() {
        let toml_str = r#"
[services.gateway]
command = "/opt/gw/bin/gateway"
args = ["--port", "{gateway_port}"]
"#;
        let config: NsgridConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.services.gateway.command, "/opt/gw/bin/gateway");
        assert_eq!(config.services.gateway.health_path, "/health");
        assert_eq!(config.services.sql.command, "rqlited");
    }

    #[test]
    fn rejects_overflowing_range() {
        let mut config = NsgridConfig::default();
        config.ports.range_start = 65500;
        config.ports.range_size = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortRangeOverflow { .. })
        ));
    }

    #[test]
    fn rejects_range_without_blocks() {
        let mut config = NsgridConfig::default();
        config.ports.range_size = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortRangeTooSmall(4))
        ));
    }

    #[test]
    fn rejects_bad_duration() {
        let mut config = NsgridConfig::default();
        config.provisioning.deadline = "forever".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Duration { field: "deadline", .. })
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = NsgridConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("range_start"));
        let parsed: NsgridConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.services.gateway, config.services.gateway);
    }

    #[test]
    fn example_config_is_valid() {
        let text = include_str!("../../../nsgrid.example.toml");
        let config: NsgridConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.ports.capacity(), 20);
        assert_eq!(config.dns.mode, DnsMode::Assume);
        assert_eq!(config.server.admin_token.as_deref(), Some("change-me"));
    }
}
