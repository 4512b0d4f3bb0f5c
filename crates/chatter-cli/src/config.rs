use anyhow::{Context, Result, bail};
use chatter_relay::RelayOptions;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatterConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:4000".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_max_connections() -> usize {
    10_000
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_command_buffer() -> usize {
    1024
}

fn default_heartbeat_interval_secs() -> u64 {
    25
}

fn default_idle_timeout_secs() -> u64 {
    60
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            outbound_buffer: default_outbound_buffer(),
            command_buffer: default_command_buffer(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatter")
}

impl ChatterConfig {
    /// Load from `custom_path`, or from `~/.chatter/config.toml` if present.
    /// Without a custom path and without a config file, defaults are used.
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = match custom_path {
            Some(path) => path.clone(),
            None => {
                let path = config_dir().join("config.toml");
                if !path.exists() {
                    info!("No config at {}, using defaults", path.display());
                    return Ok(Self::default());
                }
                path
            }
        };
        Self::load_file(&path)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config at {}", path.display()))
    }

    /// Parse config text, expanding allowlisted `${VAR}` references first
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let relay = &self.relay;
        if relay.max_connections == 0 {
            bail!("relay.max_connections must be greater than 0");
        }
        if relay.outbound_buffer == 0 {
            bail!("relay.outbound_buffer must be greater than 0");
        }
        if relay.command_buffer == 0 {
            bail!("relay.command_buffer must be greater than 0");
        }
        if relay.heartbeat_interval_secs == 0 {
            bail!("relay.heartbeat_interval_secs must be greater than 0");
        }
        if relay.idle_timeout_secs <= relay.heartbeat_interval_secs {
            bail!(
                "relay.idle_timeout_secs ({}) must be greater than relay.heartbeat_interval_secs ({})",
                relay.idle_timeout_secs,
                relay.heartbeat_interval_secs
            );
        }
        self.socket_addr()?;

        if self.server.allowed_origins.iter().any(|o| o == "*") {
            warn!("server.allowed_origins contains \"*\"; any web page may connect");
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.bind, self.server.port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid listen address {}:{}",
                    self.server.bind, self.server.port
                )
            })
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            max_connections: self.relay.max_connections,
            outbound_buffer: self.relay.outbound_buffer,
            command_buffer: self.relay.command_buffer,
            heartbeat_interval: Duration::from_secs(self.relay.heartbeat_interval_secs),
            idle_timeout: Duration::from_secs(self.relay.idle_timeout_secs),
            allowed_origins: self.server.allowed_origins.clone(),
        }
    }
}

/// Environment variables a config file may reference.
const ALLOWED_ENV_VARS: &[&str] = &["CHATTER_ALLOWED_ORIGIN", "HOME", "USER"];

/// Substitute `${NAME}` and `${NAME:-fallback}` placeholders.
///
/// Only names in [`ALLOWED_ENV_VARS`] are substituted; any other placeholder,
/// and an unterminated `${`, is copied through as written.
fn expand_env_vars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let body_start = open + 2;
        let Some(len) = rest[body_start..].find('}') else {
            rest = &rest[open..];
            break;
        };
        let body = &rest[body_start..body_start + len];
        let placeholder = &rest[open..body_start + len + 1];
        rest = &rest[body_start + len + 1..];

        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };
        if !ALLOWED_ENV_VARS.contains(&name) {
            warn!("Config references {} which is not an allowed variable", placeholder);
            out.push_str(placeholder);
            continue;
        }

        match (std::env::var(name), fallback) {
            (Ok(value), Some(fallback)) if value.is_empty() => out.push_str(fallback),
            (Ok(value), _) => out.push_str(&value),
            (Err(_), Some(fallback)) => out.push_str(fallback),
            (Err(_), None) => {}
        }
    }

    out.push_str(rest);
    out
}
