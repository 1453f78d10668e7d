//! Configuration management for pbshell.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/pbshell/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use pbshell_protocol::{DEFAULT_ESCALATION_TEMPLATE, TARGET_PLACEHOLDER};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::escalation::{EscalationConfig, PromptWaitConfig};
use crate::session::{ReaderConfig, SessionSettings};
use crate::transport::{ConnectParams, HostKeyPolicy, HostKeyVerifier};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("default_port must not be 0")]
    InvalidPort,

    #[error("connect_timeout_secs must be between 1 and 300, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidPtySize { cols: u32, rows: u32 },

    #[error("chunk_size must be between 1 and 1048576, got {0}")]
    InvalidChunkSize(usize),

    #[error("{section}.poll_interval_ms must be between 1 and 10000, got {value}")]
    InvalidPollInterval { section: &'static str, value: u64 },

    #[error("prompt_timeout_secs must be between 1 and 600, got {0}")]
    InvalidPromptTimeout(u64),

    #[error("escalation command must contain {{target}}, got {0:?}")]
    InvalidCommandTemplate(String),

    #[error("relay interval_ms must be between 1 and 10000, got {0}")]
    InvalidRelayInterval(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for millisecond poll intervals.
const MAX_INTERVAL_MS: u64 = 10_000;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Connection defaults.
    pub connection: ConnectionConfig,

    /// Background reader tuning.
    pub reader: ReaderSection,

    /// Escalation command and prompt-wait tuning.
    pub escalation: EscalationSection,

    /// Display relay cadence.
    pub relay: RelayConfig,

    /// Host verification settings.
    pub security: SecurityConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Connection defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Port used when none is given.
    pub default_port: u16,

    /// Upper bound on each blocking connect step, in seconds.
    pub connect_timeout_secs: u64,

    /// Terminal type requested for the PTY.
    pub term: String,

    /// PTY width.
    pub cols: u32,

    /// PTY height.
    pub rows: u32,
}

/// Background reader tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReaderSection {
    /// Maximum bytes per read.
    pub chunk_size: usize,

    /// Sleep between empty polls, in milliseconds.
    pub poll_interval_ms: u64,

    /// Consecutive hard read errors before the session is closed (0 = never).
    pub max_consecutive_errors: u32,
}

/// Escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EscalationSection {
    /// Command template; `{target}` is replaced by the target identity.
    pub command: String,

    /// Window in which the password prompt must appear, in seconds.
    pub prompt_timeout_secs: u64,

    /// Longest single wait for new output, in milliseconds.
    pub poll_interval_ms: u64,
}

/// Display relay cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Drain interval in milliseconds.
    pub interval_ms: u64,
}

/// Host verification settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// How unknown and changed host keys are treated.
    pub host_key_policy: HostKeyPolicy,

    /// OpenSSH known hosts file.
    pub known_hosts: PathBuf,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Also write logs to a daily rolling file.
    pub log_file: bool,

    /// Directory for log files.
    pub log_dir: PathBuf,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_port: 22,
            connect_timeout_secs: 10,
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

impl Default for ReaderSection {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            poll_interval_ms: 50,
            max_consecutive_errors: 10,
        }
    }
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            command: DEFAULT_ESCALATION_TEMPLATE.to_string(),
            prompt_timeout_secs: 8,
            poll_interval_ms: 100,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { interval_ms: 100 }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            host_key_policy: HostKeyPolicy::default(),
            known_hosts: default_data_dir().join("known_hosts"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: false,
            log_dir: default_data_dir().join("logs"),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pbshell")
        .join("config.toml")
}

/// Returns the default data directory path.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pbshell")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PBSHELL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PBSHELL_HOST_KEY_POLICY: Override host key policy
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PBSHELL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(policy) = std::env::var("PBSHELL_HOST_KEY_POLICY") {
            if !policy.is_empty() {
                match policy.parse::<HostKeyPolicy>() {
                    Ok(policy) => {
                        tracing::info!("Overriding host key policy from environment: {}", policy);
                        self.security.host_key_policy = policy;
                    }
                    Err(e) => tracing::warn!("Ignoring PBSHELL_HOST_KEY_POLICY: {}", e),
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;
        if conn.default_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if !(1..=300).contains(&conn.connect_timeout_secs) {
            return Err(ConfigError::InvalidConnectTimeout(conn.connect_timeout_secs));
        }
        if conn.cols == 0 || conn.rows == 0 {
            return Err(ConfigError::InvalidPtySize {
                cols: conn.cols,
                rows: conn.rows,
            });
        }

        if !(1..=1024 * 1024).contains(&self.reader.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(self.reader.chunk_size));
        }
        check_interval("reader", self.reader.poll_interval_ms)?;

        let esc = &self.escalation;
        if !esc.command.contains(TARGET_PLACEHOLDER) {
            return Err(ConfigError::InvalidCommandTemplate(esc.command.clone()));
        }
        if !(1..=600).contains(&esc.prompt_timeout_secs) {
            return Err(ConfigError::InvalidPromptTimeout(esc.prompt_timeout_secs));
        }
        check_interval("escalation", esc.poll_interval_ms)?;

        if !(1..=MAX_INTERVAL_MS).contains(&self.relay.interval_ms) {
            return Err(ConfigError::InvalidRelayInterval(self.relay.interval_ms));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Reader tuning derived from `[reader]`.
    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            chunk_size: self.reader.chunk_size,
            poll_interval: Duration::from_millis(self.reader.poll_interval_ms),
            max_consecutive_errors: self.reader.max_consecutive_errors,
        }
    }

    /// Escalation settings derived from `[escalation]`.
    pub fn escalation_config(&self) -> EscalationConfig {
        EscalationConfig {
            command_template: self.escalation.command.clone(),
            prompt_wait: PromptWaitConfig {
                timeout: Duration::from_secs(self.escalation.prompt_timeout_secs),
                poll_interval: Duration::from_millis(self.escalation.poll_interval_ms),
            },
        }
    }

    /// Session settings derived from this configuration.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            reader: self.reader_config(),
            escalation: self.escalation_config(),
        }
    }

    /// Relay drain interval.
    pub fn relay_interval(&self) -> Duration {
        Duration::from_millis(self.relay.interval_ms)
    }

    /// Host key verifier for `[security]`.
    pub fn host_key_verifier(&self) -> HostKeyVerifier {
        HostKeyVerifier::new(self.security.host_key_policy, &self.security.known_hosts)
    }

    /// Builds connect parameters, filling unspecified values from `[connection]`.
    pub fn connect_params(
        &self,
        host: &str,
        port: Option<u16>,
        username: &str,
        password: &str,
        timeout_secs: Option<u64>,
    ) -> ConnectParams {
        let conn = &self.connection;
        ConnectParams::new(host, username, password)
            .with_port(port.unwrap_or(conn.default_port))
            .with_timeout(Duration::from_secs(
                timeout_secs.unwrap_or(conn.connect_timeout_secs),
            ))
            .with_pty(conn.term.clone(), conn.cols, conn.rows)
    }
}

fn check_interval(section: &'static str, value: u64) -> Result<(), ConfigError> {
    if (1..=MAX_INTERVAL_MS).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidPollInterval { section, value })
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.connection.default_port, 22);
        assert_eq!(config.connection.connect_timeout_secs, 10);
        assert_eq!(config.connection.term, "xterm");
        assert_eq!(config.reader.chunk_size, 4096);
        assert_eq!(config.reader.poll_interval_ms, 50);
        assert_eq!(config.reader.max_consecutive_errors, 10);
        assert_eq!(config.escalation.command, "pbrun -u {target} bash");
        assert_eq!(config.escalation.prompt_timeout_secs, 8);
        assert_eq!(config.relay.interval_ms, 100);
        assert_eq!(config.security.host_key_policy, HostKeyPolicy::TrustOnFirstUse);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.log_file);
    }

    #[test]
    fn test_default_paths_live_under_data_dir() {
        let config = Config::default();
        assert!(config.security.known_hosts.ends_with("pbshell/known_hosts"));
        assert!(config.logging.log_dir.ends_with("pbshell/logs"));
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[connection]
connect_timeout_secs = 30

[security]
host_key_policy = "strict"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.connection.connect_timeout_secs, 30);
        assert_eq!(config.security.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.connection.default_port, 22);
        assert_eq!(config.reader, ReaderSection::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[connection]
default_port = 2222
connect_timeout_secs = 5
term = "vt100"
cols = 132
rows = 43

[reader]
chunk_size = 8192
poll_interval_ms = 20
max_consecutive_errors = 0

[escalation]
command = "sudo -iu {target}"
prompt_timeout_secs = 15
poll_interval_ms = 50

[relay]
interval_ms = 250

[security]
host_key_policy = "accept-any"
known_hosts = "/tmp/kh"

[logging]
level = "debug"
log_file = true
log_dir = "/tmp/logs"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.connection.default_port, 2222);
        assert_eq!(config.connection.term, "vt100");
        assert_eq!((config.connection.cols, config.connection.rows), (132, 43));
        assert_eq!(config.reader.chunk_size, 8192);
        assert_eq!(config.reader.max_consecutive_errors, 0);
        assert_eq!(config.escalation.command, "sudo -iu {target}");
        assert_eq!(config.relay.interval_ms, 250);
        assert_eq!(config.security.host_key_policy, HostKeyPolicy::AcceptAny);
        assert_eq!(config.security.known_hosts, PathBuf::from("/tmp/kh"));
        assert!(config.logging.log_file);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[connection\nterm = \"x\"");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_unknown_policy() {
        let toml = r#"
[security]
host_key_policy = "yolo"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut original = Config::default();
        original.connection.default_port = 2200;
        original.security.host_key_policy = HostKeyPolicy::Strict;
        original.logging.level = "warn".to_string();

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[escalation]"));
        assert!(toml.contains("host_key_policy = \"strict\""));
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.reader.max_consecutive_errors = 3;
        original.save(&config_path).unwrap();

        assert_eq!(Config::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("pbshell"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::default();
        let reader = config.reader_config();
        assert_eq!(reader, ReaderConfig::default());
        assert_eq!(config.escalation_config(), EscalationConfig::default());
        assert_eq!(config.relay_interval(), Duration::from_millis(100));
        assert_eq!(
            config.host_key_verifier().policy(),
            HostKeyPolicy::TrustOnFirstUse
        );
    }

    #[test]
    fn test_connect_params_fill_defaults() {
        let mut config = Config::default();
        config.connection.default_port = 2222;

        let params = config.connect_params("db01", None, "alice", "pw", None);
        assert_eq!(params.port, 2222);
        assert_eq!(params.timeout, Duration::from_secs(10));

        let params = config.connect_params("db01", Some(22), "alice", "pw", Some(3));
        assert_eq!(params.port, 22);
        assert_eq!(params.timeout, Duration::from_secs(3));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("PBSHELL_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "debug");

        std::env::remove_var("PBSHELL_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("PBSHELL_LOG_LEVEL", "");
        std::env::remove_var("PBSHELL_HOST_KEY_POLICY");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("PBSHELL_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_host_key_policy() {
        std::env::remove_var("PBSHELL_LOG_LEVEL");
        std::env::set_var("PBSHELL_HOST_KEY_POLICY", "strict");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.security.host_key_policy, HostKeyPolicy::Strict);

        std::env::set_var("PBSHELL_HOST_KEY_POLICY", "bogus");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.security.host_key_policy, HostKeyPolicy::TrustOnFirstUse);

        std::env::remove_var("PBSHELL_HOST_KEY_POLICY");
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut config = Config::default();
        config.connection.default_port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));
    }

    #[test]
    fn test_validate_connect_timeout_range() {
        let mut config = Config::default();
        config.connection.connect_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidConnectTimeout(0)));
        config.connection.connect_timeout_secs = 301;
        assert_eq!(config.validate(), Err(ConfigError::InvalidConnectTimeout(301)));
    }

    #[test]
    fn test_validate_poll_intervals() {
        let mut config = Config::default();
        config.reader.poll_interval_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPollInterval {
                section: "reader",
                value: 0
            })
        );

        let mut config = Config::default();
        config.escalation.poll_interval_ms = 20_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPollInterval {
                section: "escalation",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_command_template() {
        let mut config = Config::default();
        config.escalation.command = "pbrun bash".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCommandTemplate("pbrun bash".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
        config.logging.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_error_messages() {
        let err = ConfigError::InvalidCommandTemplate("x".to_string());
        assert_eq!(err.to_string(), "escalation command must contain {target}, got \"x\"");
    }
}
