//! Load config from file and environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration. File: $LANMSG_CONFIG, ~/.config/lanmsg/config.toml or /etc/lanmsg/config.toml.
/// Env overrides: LANMSG_HOST_PORT, LANMSG_DISCOVERY_PORT, LANMSG_SERVICE_NAME, LANMSG_CONNECT_RETRIES.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Address the host listener binds (default 0.0.0.0).
    pub bind_addr: IpAddr,
    /// Host listener TCP port (default 8080).
    pub host_port: u16,
    /// Discovery UDP port (default 45678).
    pub discovery_port: u16,
    pub service_type: String,
    /// Instance name prefix; a random suffix is appended on registration.
    pub service_name: String,
    pub connect_timeout_ms: u64,
    /// Read/write timeout on an open connection.
    pub io_timeout_ms: u64,
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    pub listen_backlog: u32,
    pub peer_wait_interval_ms: u64,
    /// Run one ICMP probe after the last failed connect attempt (diagnostic only).
    pub probe_on_failure: bool,
    /// Prefix outgoing payloads with the local instance name.
    pub stamp_sender: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            host_port: 8080,
            discovery_port: 45678,
            service_type: "_lanmsg._tcp".to_string(),
            service_name: "lanmsg".to_string(),
            connect_timeout_ms: 1000,
            io_timeout_ms: 5000,
            connect_retries: 10,
            retry_delay_ms: 100,
            listen_backlog: 55,
            peer_wait_interval_ms: 500,
            probe_on_failure: false,
            stamp_sender: false,
        }
    }
}

/// Config file or value error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

impl Config {
    pub fn host_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.host_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn peer_wait_interval(&self) -> Duration {
        Duration::from_millis(self.peer_wait_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_retries == 0 {
            return Err(ConfigError::Invalid("connect_retries must be at least 1"));
        }
        if self.connect_timeout_ms == 0 || self.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero"));
        }
        if self.peer_wait_interval_ms == 0 {
            return Err(ConfigError::Invalid("peer_wait_interval_ms must be non-zero"));
        }
        if self.service_type.trim_end_matches('.').is_empty() {
            return Err(ConfigError::Invalid("service_type is empty"));
        }
        if self.service_name.is_empty() {
            return Err(ConfigError::Invalid("service_name is empty"));
        }
        Ok(())
    }

    /// Apply env overrides. Unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("LANMSG_HOST_PORT").and_then(|s| s.parse().ok()) {
            self.host_port = p;
        }
        if let Some(p) = var("LANMSG_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
            self.discovery_port = p;
        }
        if let Some(s) = var("LANMSG_SERVICE_NAME").filter(|s| !s.is_empty()) {
            self.service_name = s;
        }
        if let Some(n) = var("LANMSG_CONNECT_RETRIES").and_then(|s| s.parse().ok()) {
            self.connect_retries = n;
        }
    }
}

/// Load config: merge default, then config file (explicit path or first existing default), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("LANMSG_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/lanmsg/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanmsg/config.toml"));
    out
}

pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
