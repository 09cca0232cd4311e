//! Configuration management for coordkit.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::ServerConfig;
use crate::cli::Args;
use crate::ensemble::EnsembleConfig;
use crate::session::{RetryPolicy, SessionConfig, DEFAULT_NODE_DATA};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP API server.
    pub server: ServerSection,
    /// Client session settings.
    pub client: ClientSection,
    /// Embedded ensemble settings.
    pub ensemble: EnsembleSection,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Enable graceful shutdown.
    pub graceful_shutdown: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            graceful_shutdown: true,
        }
    }
}

/// Client configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Ensemble endpoints (`host:port`), tried in order.
    pub endpoints: Vec<String>,
    /// Requested session timeout.
    pub session_timeout_ms: u64,
    /// Overall deadline for establishing a session.
    pub connection_timeout_ms: u64,
    /// First retry delay.
    pub retry_base_delay_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Cap for a single retry delay.
    pub retry_max_delay_ms: u64,
    /// Data stored by `create` when none is given.
    pub default_data: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            endpoints: session.endpoints,
            session_timeout_ms: session.session_timeout.as_millis() as u64,
            connection_timeout_ms: session.connection_timeout.as_millis() as u64,
            retry_base_delay_ms: session.retry.base_delay.as_millis() as u64,
            max_retries: session.retry.max_retries,
            retry_max_delay_ms: session.retry.max_delay.as_millis() as u64,
            default_data: String::from_utf8_lossy(DEFAULT_NODE_DATA).into_owned(),
        }
    }
}

/// Ensemble configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleSection {
    /// Recent changes kept for watch rearming.
    pub change_log_capacity: usize,
    /// How often lapsed sessions are reaped.
    pub reaper_interval_ms: u64,
    /// Bounds for negotiated session timeouts.
    pub min_session_timeout_ms: u64,
    pub max_session_timeout_ms: u64,
}

impl Default for EnsembleSection {
    fn default() -> Self {
        let ensemble = EnsembleConfig::default();
        Self {
            change_log_capacity: ensemble.change_log_capacity,
            reaper_interval_ms: ensemble.reaper_interval.as_millis() as u64,
            min_session_timeout_ms: ensemble.min_session_timeout.as_millis() as u64,
            max_session_timeout_ms: ensemble.max_session_timeout.as_millis() as u64,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or a full filter directive.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn split_endpoints(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("COORDKIT_HOST") {
            self.server.host = host;
        }

        if let Some(port) = var("COORDKIT_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }

        if let Some(endpoints) = var("COORDKIT_ENDPOINT") {
            let endpoints = split_endpoints(&endpoints);
            if !endpoints.is_empty() {
                self.client.endpoints = endpoints;
            }
        }

        if let Some(ms) = var("COORDKIT_SESSION_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.client.session_timeout_ms = ms;
        }

        if let Some(level) = var("COORDKIT_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = args.host {
            self.server.host = host.to_string();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if !args.endpoints.is_empty() {
            self.client.endpoints = args.endpoints.clone();
        }
        if let Some(ms) = args.session_timeout_ms {
            self.client.session_timeout_ms = ms;
        }
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(ref path) = args.config {
            config = Config::from_file(path)?;
        }

        config.apply_env();
        config.apply_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.endpoints.is_empty() {
            return Err(ConfigError::Invalid("client.endpoints must not be empty"));
        }
        if self.client.session_timeout_ms == 0 {
            return Err(ConfigError::Invalid("client.session_timeout_ms must be positive"));
        }
        if self.ensemble.min_session_timeout_ms > self.ensemble.max_session_timeout_ms {
            return Err(ConfigError::Invalid(
                "ensemble.min_session_timeout_ms exceeds max_session_timeout_ms",
            ));
        }
        Ok(())
    }

    /// Session settings for the client.
    pub fn to_session_config(&self) -> SessionConfig {
        let retry = RetryPolicy::exponential(
            Duration::from_millis(self.client.retry_base_delay_ms),
            self.client.max_retries,
        )
        .with_max_delay(Duration::from_millis(self.client.retry_max_delay_ms));

        SessionConfig {
            endpoints: self.client.endpoints.clone(),
            retry,
            session_timeout: Duration::from_millis(self.client.session_timeout_ms),
            connection_timeout: Duration::from_millis(self.client.connection_timeout_ms),
            default_data: self.client.default_data.clone().into_bytes(),
        }
    }

    /// Settings for the embedded ensemble.
    pub fn to_ensemble_config(&self) -> EnsembleConfig {
        EnsembleConfig {
            change_log_capacity: self.ensemble.change_log_capacity,
            reaper_interval: Duration::from_millis(self.ensemble.reaper_interval_ms.max(1)),
            min_session_timeout: Duration::from_millis(self.ensemble.min_session_timeout_ms),
            max_session_timeout: Duration::from_millis(self.ensemble.max_session_timeout_ms),
        }
    }

    /// Convert to ServerConfig for the API server.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let host: IpAddr = self
            .server
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.server.host.clone()))?;

        let mut server_config = ServerConfig::new(host.to_string(), self.server.port);
        if !self.server.graceful_shutdown {
            server_config = server_config.without_graceful_shutdown();
        }
        Ok(server_config)
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Invalid host address.
    InvalidHost(String),
    /// A setting is out of range.
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::InvalidHost(host) => write!(f, "invalid host address: {}", host),
            Self::Invalid(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.client.endpoints, vec!["127.0.0.1:2181"]);
        assert_eq!(config.client.session_timeout_ms, 60_000);
        assert_eq!(config.client.default_data, "127.0.0.1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "server": { "host": "0.0.0.0", "port": 8080 },
            "client": {
                "endpoints": ["10.0.0.1:2181", "10.0.0.2:2181"],
                "session_timeout_ms": 5000,
                "max_retries": 5
            },
            "ensemble": { "change_log_capacity": 64 }
        }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.client.endpoints.len(), 2);
        assert_eq!(config.client.max_retries, 5);
        assert_eq!(config.client.retry_base_delay_ms, 1000); // Default
        assert_eq!(config.ensemble.change_log_capacity, 64);
    }

    #[test]
    fn test_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("COORDKIT_PORT", "4000"),
            ("COORDKIT_ENDPOINT", "10.0.0.1:2181, 10.0.0.2:2181"),
            ("COORDKIT_SESSION_TIMEOUT_MS", "3000"),
            ("RUST_LOG", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_vars(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.client.endpoints, vec!["10.0.0.1:2181", "10.0.0.2:2181"]);
        assert_eq!(config.client.session_timeout_ms, 3000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_args_override_env() {
        let mut config = Config::default();
        config.apply_vars(|key| (key == "COORDKIT_PORT").then(|| "4000".to_string()));

        let args = Args {
            port: Some(5000),
            endpoints: vec!["127.0.0.1:2182".into()],
            log_level: Some("trace".into()),
            ..Args::default()
        };
        config.apply_args(&args);

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.client.endpoints, vec!["127.0.0.1:2182"]);
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_to_session_config() {
        let mut config = Config::default();
        config.client.retry_base_delay_ms = 50;
        config.client.max_retries = 2;
        config.client.default_data = "node-a".into();

        let session = config.to_session_config();
        assert_eq!(session.retry.base_delay, Duration::from_millis(50));
        assert_eq!(session.retry.max_retries, 2);
        assert_eq!(session.default_data, b"node-a");
    }

    #[test]
    fn test_to_server_config() {
        let config = Config::default();
        let server_config = config.to_server_config().unwrap();
        assert_eq!(server_config.bind_address(), "127.0.0.1:3000");
    }

    #[test]
    fn test_invalid_host() {
        let mut config = Config::default();
        config.server.host = "not-an-ip".to_string();
        assert!(config.to_server_config().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_endpoints() {
        let mut config = Config::default();
        config.client.endpoints.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_config_serialization() {
        let json = serde_json::to_string_pretty(&Config::default()).unwrap();
        assert!(json.contains("\"endpoints\""));
        assert!(json.contains("\"change_log_capacity\""));
    }
}
