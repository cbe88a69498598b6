//! Configuration management for quorumd.
//!
//! Configuration is set via environment variables:
//! - `QUORUMD_TOKEN` - Required. Pre-shared secret between coordinator and agents.
//! - `QUORUMD_SERVER` - Optional. Set to `1`/`true` to run the coordinator. Defaults to off.
//! - `QUORUMD_SEED` - Optional. Coordinator base URI (e.g. `http://coordinator:897/`).
//!   When set the process runs an agent against that coordinator. A coordinator
//!   with no seed configured runs an embedded agent against itself.
//! - `QUORUMD_SERVER_PORT` - Optional. Coordinator listen port. Defaults to `897`.
//! - `QUORUMD_AGENT_PORT` - Optional. Agent uptime-probe port. Defaults to `898`.
//! - `QUORUMD_HOME` - Optional. State directory for JSON snapshots. Defaults to `~/.quorumd`.
//! - `QUORUMD_HOSTNAME` - Optional. Agent identity override. Defaults to the OS hostname.
//! - `QUORUMD_TAGS` - Optional. Comma-separated tags this agent reports (e.g. `web,eu`).
//! - `QUORUMD_PING_INTERVAL` - Optional. Agent presence ping interval in seconds. Defaults to `30`.
//! - `QUORUMD_DEBUG` - Optional. Set to `1`/`true` for verbose state-transition logging.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Process configuration shared by the coordinator and the agent runtime.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-shared secret used for the URI signature scheme and token signing
    pub token: String,

    /// Run the coordinator in this process
    pub server_enabled: bool,

    /// Coordinator base URI the agent connects to (trailing slash included)
    pub seed_uri: Option<String>,

    /// Coordinator listen port
    pub server_port: u16,

    /// Agent uptime-probe port
    pub agent_port: u16,

    /// Directory holding `users.json`, `templates.json` and `consensus.json`
    pub home_dir: PathBuf,

    /// Identity this process registers under when running as an agent
    pub hostname: String,

    /// Tags this agent reports on every ping
    pub tags: Vec<String>,

    /// Agent presence ping interval; liveness window is five times this
    pub ping_interval: Duration,

    /// Verbose state-transition logging
    pub debug: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `QUORUMD_TOKEN` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = std::env::var("QUORUMD_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("QUORUMD_TOKEN".to_string()))?;

        let server_enabled = flag_from_env("QUORUMD_SERVER");

        let seed_uri = std::env::var("QUORUMD_SEED")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let server_port = port_from_env("QUORUMD_SERVER_PORT", 897)?;
        let agent_port = port_from_env("QUORUMD_AGENT_PORT", 898)?;

        let home_dir = std::env::var("QUORUMD_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home_dir());

        let hostname = match std::env::var("QUORUMD_HOSTNAME") {
            Ok(h) if !h.trim().is_empty() => h.trim().to_string(),
            _ => os_hostname(),
        };

        let tags: Vec<String> = std::env::var("QUORUMD_TAGS")
            .unwrap_or_default()
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let ping_secs: u64 = std::env::var("QUORUMD_PING_INTERVAL")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("QUORUMD_PING_INTERVAL".to_string(), format!("{}", e))
            })?;
        if ping_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "QUORUMD_PING_INTERVAL".to_string(),
                "must be at least 1 second".to_string(),
            ));
        }

        let debug = flag_from_env("QUORUMD_DEBUG");

        Ok(Self {
            token,
            server_enabled,
            seed_uri,
            server_port,
            agent_port,
            home_dir,
            hostname,
            tags,
            ping_interval: Duration::from_secs(ping_secs),
            debug,
        })
    }

    /// Path of a state file under the home directory.
    pub fn home_file(&self, name: &str) -> PathBuf {
        self.home_dir.join(name)
    }

    /// Base URI of the coordinator this process talks to.
    ///
    /// Falls back to the local coordinator when running with an embedded agent.
    pub fn effective_seed_uri(&self) -> Option<String> {
        match &self.seed_uri {
            Some(uri) => Some(uri.clone()),
            None if self.server_enabled => Some(format!("http://127.0.0.1:{}/", self.server_port)),
            None => None,
        }
    }
}

fn flag_from_env(key: &str) -> bool {
    matches!(
        std::env::var(key).unwrap_or_default().trim(),
        "1" | "true" | "yes"
    )
}

fn port_from_env(key: &str, default: u16) -> Result<u16, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("{}", e)))
}

fn default_home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".quorumd")
}

fn os_hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            token: "secret".to_string(),
            server_enabled: true,
            seed_uri: None,
            server_port: 897,
            agent_port: 898,
            home_dir: PathBuf::from("/var/lib/quorumd"),
            hostname: "node-1".to_string(),
            tags: Vec::new(),
            ping_interval: Duration::from_secs(30),
            debug: false,
        }
    }

    #[test]
    fn home_file_joins_under_home_dir() {
        let config = base_config();
        assert_eq!(
            config.home_file("consensus.json"),
            PathBuf::from("/var/lib/quorumd/consensus.json")
        );
    }

    #[test]
    fn effective_seed_prefers_explicit_uri() {
        let mut config = base_config();
        config.seed_uri = Some("http://coordinator:897/".to_string());
        assert_eq!(
            config.effective_seed_uri().as_deref(),
            Some("http://coordinator:897/")
        );

        config.seed_uri = None;
        assert_eq!(
            config.effective_seed_uri().as_deref(),
            Some("http://127.0.0.1:897/")
        );

        config.server_enabled = false;
        assert_eq!(config.effective_seed_uri(), None);
    }
}
