//! Configuration module
//!
//! Handles loading, validating and persisting agent configuration from TOML
//! files. The agent writes back to the same file when registration hands it a
//! new identity.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::identity::AgentIdentity;
use crate::error::AgentError;

/// Main configuration structure for the Fleetwatch Agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base HTTP(S) URL of the backend
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Server identifier assigned by the backend (0 = unregistered)
    #[serde(default)]
    pub server_id: u64,

    /// Secret key assigned by the backend
    #[serde(default)]
    pub secret_key: String,

    /// One-time registration token used when no identity is stored
    #[serde(default)]
    pub registration_token: Option<String>,

    /// Task intervals
    #[serde(default)]
    pub intervals: IntervalConfig,

    /// Enabled metric categories
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Operation handler settings
    #[serde(default)]
    pub handlers: HandlerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Interval configuration, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_metrics_interval")]
    pub metrics_secs: u64,

    #[serde(default = "default_settings_interval")]
    pub settings_secs: u64,

    /// Base delay of the reconnect backoff
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_secs: u64,
}

/// Metric categories reported by the metrics runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub cpu: bool,
    #[serde(default = "default_true")]
    pub memory: bool,
    #[serde(default = "default_true")]
    pub disk: bool,
    #[serde(default = "default_true")]
    pub network: bool,
    #[serde(default = "default_true")]
    pub load: bool,
}

/// Settings for the opaque operation handlers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Largest file `file_read` will return, in bytes
    #[serde(default = "default_max_read_bytes")]
    pub max_file_read_bytes: u64,

    /// Shell spawned for terminal sessions
    #[serde(default = "default_shell")]
    pub shell: String,

    /// nginx executable
    #[serde(default = "default_nginx_bin")]
    pub nginx_bin: String,

    /// Directory listed by `nginx_sites`
    #[serde(default = "default_nginx_sites_dir")]
    pub nginx_sites_dir: String,

    /// Docker socket path
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path (optional, stderr when unset)
    pub file: Option<String>,
}

// Default value functions
fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_metrics_interval() -> u64 {
    30
}

fn default_settings_interval() -> u64 {
    60
}

fn default_reconnect_base() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_max_read_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_nginx_bin() -> String {
    "nginx".to_string()
}

fn default_nginx_sites_dir() -> String {
    "/etc/nginx/sites-enabled".to_string()
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_interval(),
            metrics_secs: default_metrics_interval(),
            settings_secs: default_settings_interval(),
            reconnect_base_secs: default_reconnect_base(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            cpu: true,
            memory: true,
            disk: true,
            network: true,
            load: true,
        }
    }
}

impl MetricsConfig {
    /// True when at least one category is enabled
    pub fn any_enabled(&self) -> bool {
        self.cpu || self.memory || self.disk || self.network || self.load
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_file_read_bytes: default_max_read_bytes(),
            shell: default_shell(),
            nginx_bin: default_nginx_bin(),
            nginx_sites_dir: default_nginx_sites_dir(),
            docker_socket: default_docker_socket(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            server_id: 0,
            secret_key: String::new(),
            registration_token: None,
            intervals: IntervalConfig::default(),
            metrics: MetricsConfig::default(),
            handlers: HandlerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Reject values the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            anyhow::bail!("server_url must start with http:// or https://: {}", self.server_url);
        }
        if self.intervals.heartbeat_secs == 0 || self.intervals.metrics_secs == 0 {
            anyhow::bail!("heartbeat and metrics intervals must be greater than zero");
        }
        if self.intervals.settings_secs == 0 || self.intervals.reconnect_base_secs == 0 {
            anyhow::bail!("settings and reconnect intervals must be greater than zero");
        }
        Ok(())
    }

    /// Identity tuple stored in this configuration
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            server_id: self.server_id,
            secret_key: self.secret_key.clone(),
            registration_token: self
                .registration_token
                .clone()
                .filter(|token| !token.is_empty()),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.heartbeat_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.metrics_secs)
    }

    pub fn settings_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.settings_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_secs(self.intervals.reconnect_base_secs)
    }
}

/// Configuration persistence shared by the running agent.
///
/// Holds the file path next to the in-memory copy so that registration can
/// write the new identity back without other components knowing where the
/// configuration lives.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: RwLock<Config>,
}

impl ConfigStore {
    /// Load the configuration at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;
        Ok(Self {
            path,
            config: RwLock::new(config),
        })
    }

    /// Wrap an already loaded configuration
    pub fn new<P: AsRef<Path>>(path: P, config: Config) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config: RwLock::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current configuration
    pub fn snapshot(&self) -> Config {
        self.config.read().clone()
    }

    /// Persist a freshly registered identity. The registration token is
    /// single use, so it is cleared once it has been exchanged.
    pub fn save_identity(&self, identity: &AgentIdentity) -> std::result::Result<(), AgentError> {
        let updated = {
            let mut config = self.config.write();
            config.server_id = identity.server_id;
            config.secret_key = identity.secret_key.clone();
            config.registration_token = None;
            config.clone()
        };

        updated
            .save(&self.path)
            .map_err(|e| AgentError::Config(format!("{:#}", e)))?;

        tracing::info!(
            server_id = identity.server_id,
            path = %self.path.display(),
            "Agent identity persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server_url, "http://localhost:8080");
        assert_eq!(config.server_id, 0);
        assert!(!config.identity().is_configured());
        assert!(config.metrics.any_enabled());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_content = r#"
            server_url = "https://fleet.example.com"
            registration_token = "tok-123"

            [intervals]
            heartbeat_secs = 10
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.server_url, "https://fleet.example.com");
        assert_eq!(config.intervals.heartbeat_secs, 10);
        assert_eq!(config.intervals.metrics_secs, 30);
        assert_eq!(config.identity().registration_token.as_deref(), Some("tok-123"));
    }

    #[test]
    fn test_empty_token_is_treated_as_absent() {
        let config: Config = toml::from_str(r#"registration_token = """#).unwrap();
        assert!(config.identity().registration_token.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let config = Config {
            server_url: "ftp://nope".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_identity_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        let config = Config {
            registration_token: Some("tok".to_string()),
            ..Config::default()
        };
        config.save(&path).unwrap();

        let store = ConfigStore::open(&path).unwrap();
        store
            .save_identity(&AgentIdentity {
                server_id: 42,
                secret_key: "s3cret".to_string(),
                registration_token: None,
            })
            .unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.server_id, 42);
        assert_eq!(reloaded.secret_key, "s3cret");
        assert!(reloaded.registration_token.is_none());
        assert!(store.snapshot().identity().is_configured());
    }
}
