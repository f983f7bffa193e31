/// Configuration for the portero proxy
///
/// Every setting can come from a TOML file, from the command line, or fall
/// back to its default; the CLI layer merges the three with flags winning.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::ReadPreference;
use crate::error::{ConfigError, PorteroResult};
use crate::proxy::dispatcher::DispatcherConfig;
use crate::proxy::pool::PoolConfig;

const BACKEND_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the proxy listens on
    pub addr: String,
    /// Shared secret for clients and backends; empty disables auth
    pub password: Option<String>,
    /// `host:port` list used for topology bootstrap
    pub startup_nodes: Vec<String>,
    /// Backend dial timeout in seconds
    pub connect_timeout_secs: u64,
    /// Minimum gap between two topology reloads, in seconds
    pub slots_reload_interval_secs: u64,
    /// Connections dialed eagerly per backend pool
    pub backend_init_connections: usize,
    /// Idle connections kept per backend pool
    pub backend_idle_connections: usize,
    /// 0 = master, 1 = slave, 2 = slave-idc
    pub read_prefer: u8,
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
    /// Capacity of the dispatcher's request channel
    pub request_channel_size: usize,
    /// Capacity of each task runner's input channel
    pub task_channel_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8088".to_string(),
            password: None,
            startup_nodes: vec!["127.0.0.1:7001".to_string()],
            connect_timeout_secs: 3,
            slots_reload_interval_secs: 3,
            backend_init_connections: 0,
            backend_idle_connections: 5,
            read_prefer: 0,
            log_level: "info".to_string(),
            request_channel_size: 10_000,
            task_channel_size: 50_000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> PorteroResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PorteroResult<()> {
        if self.addr.trim().is_empty() {
            return Err(ConfigError::Validation("addr must not be empty".to_string()).into());
        }
        if self.startup_nodes.is_empty() {
            return Err(
                ConfigError::Validation("startup-nodes must not be empty".to_string()).into(),
            );
        }
        for node in &self.startup_nodes {
            validate_endpoint(node)?;
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "connect-timeout must be greater than 0".to_string(),
            )
            .into());
        }
        if self.slots_reload_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "slots-reload-interval must be greater than 0".to_string(),
            )
            .into());
        }
        if self.backend_idle_connections == 0 {
            return Err(ConfigError::Validation(
                "backend-idle-connections must be greater than 0".to_string(),
            )
            .into());
        }
        if self.backend_init_connections > self.backend_idle_connections {
            return Err(ConfigError::Validation(
                "backend-init-connections must not exceed backend-idle-connections".to_string(),
            )
            .into());
        }
        if self.read_prefer > 2 {
            return Err(ConfigError::Validation(
                "read-prefer must be 0 (master), 1 (slave) or 2 (slave-idc)".to_string(),
            )
            .into());
        }
        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(
                    ConfigError::Validation(format!("invalid log level: {}", other)).into(),
                )
            }
        }
        if self.request_channel_size == 0 || self.task_channel_size == 0 {
            return Err(ConfigError::Validation(
                "channel sizes must be greater than 0".to_string(),
            )
            .into());
        }
        Ok(())
    }

    pub fn read_preference(&self) -> PorteroResult<ReadPreference> {
        ReadPreference::try_from(self.read_prefer)
    }

    pub fn pool_config(&self) -> PorteroResult<PoolConfig> {
        let prefer = self.read_preference()?;
        Ok(PoolConfig {
            init_cap: self.backend_init_connections,
            max_idle: self.backend_idle_connections,
            idle_timeout: BACKEND_IDLE_TIMEOUT,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            password: self.password.clone(),
            send_readonly: prefer.send_readonly(),
        })
    }

    pub fn dispatcher_config(&self) -> PorteroResult<DispatcherConfig> {
        Ok(DispatcherConfig {
            startup_nodes: self.startup_nodes.clone(),
            read_prefer: self.read_preference()?,
            slots_reload_interval: Duration::from_secs(self.slots_reload_interval_secs),
            request_channel_size: self.request_channel_size,
            task_channel_size: self.task_channel_size,
        })
    }
}

/// `host:port` with a non-empty host and a numeric port
fn validate_endpoint(node: &str) -> PorteroResult<()> {
    let Some(colon) = node.rfind(':') else {
        return Err(
            ConfigError::Validation(format!("invalid startup node: {}", node)).into(),
        );
    };
    let (host, port) = (&node[..colon], &node[colon + 1..]);
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(ConfigError::Validation(format!("invalid startup node: {}", node)).into());
    }
    Ok(())
}
