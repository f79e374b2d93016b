use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::upstream::Algorithm;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub server: Option<ServerConfig>,
    pub balancer: Option<BalancerConfig>,
    pub groups: Option<HashMap<String, GroupConfig>>,
}

impl Config {
    /// Applies defaults, validates, and sanitizes the configuration.
    /// This ensures that the configuration is in a consistent and usable state
    /// by filling in missing values and dropping invalid server entries.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        let mut server_cfg = self.server.take().unwrap_or_default();
        server_cfg.bind_addr = server_cfg.bind_addr.or_else(|| Some(DEFAULT_BIND_ADDR.to_string()));
        self.server = Some(server_cfg);

        let mut balancer_cfg = self.balancer.take().unwrap_or_default();
        balancer_cfg.health_check_interval_secs = Some(
            balancer_cfg
                .health_check_interval_secs
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_SECS)
                .max(1),
        );
        balancer_cfg.health_check_backoff_secs = Some(
            balancer_cfg
                .health_check_backoff_secs
                .unwrap_or(DEFAULT_HEALTH_CHECK_BACKOFF_SECS)
                .max(1),
        );
        balancer_cfg.shutdown_grace_secs =
            balancer_cfg.shutdown_grace_secs.or(Some(DEFAULT_SHUTDOWN_GRACE_SECS));
        self.balancer = Some(balancer_cfg);

        let groups = self.groups.take().unwrap_or_else(get_default_groups);

        let mut validated = HashMap::with_capacity(groups.len());
        for (domain, mut group) in groups {
            let domain = domain.trim().to_string();
            if domain.is_empty() {
                warn!("Skipping group with empty domain key");
                continue;
            }
            group.servers = validate_and_dedupe_servers(&domain, group.servers)?;
            validated.insert(domain, group);
        }
        if validated.is_empty() {
            return Err(ConfigError::ConfigError("No valid upstream groups configured".to_string()));
        }
        self.groups = Some(validated);

        Ok(self)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BalancerConfig {
    pub health_check_interval_secs: Option<u64>,
    pub health_check_backoff_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

/// One named routing target: a selection algorithm and its member servers.
#[derive(Debug, Deserialize, Clone)]
pub struct GroupConfig {
    pub algorithm: Algorithm,
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_server_weight")]
    pub weight: u32,
    #[serde(default = "default_server_timeout_secs")]
    pub timeout_secs: u64,
}

impl ServerEntry {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_HEALTH_CHECK_BACKOFF_SECS: u64 = 5;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_SERVER_WEIGHT: u32 = 1;
pub const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 2;

pub fn default_server_weight() -> u32 {
    DEFAULT_SERVER_WEIGHT
}

pub fn default_server_timeout_secs() -> u64 {
    DEFAULT_SERVER_TIMEOUT_SECS
}

pub fn try_load_config(path: &str) -> Result<Option<Config>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<Config>(&raw) {
            Ok(cfg) => {
                info!(path = %path, "Loaded config");
                Ok(Some(cfg))
            }
            Err(e) => {
                error!(path = %path, error = %e, "Failed to parse config");
                Err(ConfigError::ConfigError(e.to_string()))
            }
        },
        Err(e) => {
            if e.kind() == std::io::ErrorKind::NotFound {
                info!(path = %path, "No config file found, using defaults");
                Ok(None)
            } else {
                Err(ConfigError::ConfigError(e.to_string()))
            }
        }
    }
}

pub fn validate_and_dedupe_servers(
    domain: &str,
    servers: Vec<ServerEntry>,
) -> Result<Vec<ServerEntry>, ConfigError> {
    let mut seen = HashSet::new();

    let validated: Vec<ServerEntry> = servers
        .into_iter()
        .filter_map(|mut s| {
            s.host = s.host.trim().to_string();

            if s.host.is_empty() {
                warn!(domain = %domain, "Skipping server with empty host");
                return None;
            }
            if s.port == 0 {
                warn!(domain = %domain, host = %s.host, "Skipping server with port 0");
                return None;
            }
            if s.weight == 0 {
                warn!(domain = %domain, host = %s.host, port = s.port, "Skipping server with zero weight");
                return None;
            }
            if s.timeout_secs == 0 {
                warn!(domain = %domain, host = %s.host, port = s.port, "Skipping server with zero timeout");
                return None;
            }

            if seen.insert((s.host.clone(), s.port)) {
                Some(s)
            } else {
                warn!(domain = %domain, host = %s.host, port = s.port, "Dropping duplicate server");
                None
            }
        })
        .collect();

    if validated.is_empty() {
        return Err(ConfigError::ConfigError(format!(
            "Group '{}' has no valid servers configured",
            domain
        )));
    }

    Ok(validated)
}

/// Built-in group set used when no config file is present.
pub fn get_default_groups() -> HashMap<String, GroupConfig> {
    let mut groups = HashMap::new();
    groups.insert(
        "round_robin.cn.edu".to_string(),
        GroupConfig {
            algorithm: Algorithm::WeightedRoundRobin,
            servers: vec![
                entry("127.0.0.1", 8080, 1, 2),
                entry("127.0.0.1", 8081, 3, 2),
                entry("127.0.0.1", 8082, 2, 3),
            ],
        },
    );
    groups.insert(
        "least_time.cn.edu".to_string(),
        GroupConfig {
            algorithm: Algorithm::LeastResponseTime,
            servers: vec![
                entry("127.0.0.1", 8083, 1, 2),
                entry("127.0.0.1", 8084, 1, 2),
                entry("127.0.0.1", 8085, 1, 3),
            ],
        },
    );
    groups
}

fn entry(host: &str, port: u16, weight: u32, timeout_secs: u64) -> ServerEntry {
    ServerEntry { host: host.to_string(), port, weight, timeout_secs }
}
