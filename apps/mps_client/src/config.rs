use std::fs;

use mps_core::{CoreConfig, PoolConfig, RpcConfig, SessionConfig};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file '{0}': {1}")]
    IoError(String, #[source] std::io::Error),

    #[error("JSON parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Schema validation failed: {0}")]
    ValidationError(String),
}

/// Types loaded from JSON and checked against their generated schema first
pub trait Validatable: JsonSchema + for<'de> Deserialize<'de> {
    fn from_json_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.to_string(), e))?;

        Self::from_json_str(&content)
    }

    fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;

        let schema = schemars::schema_for!(Self);
        let schema_json = serde_json::to_value(&schema)?;

        let compiled = jsonschema::validator_for(&schema_json)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        compiled
            .validate(&value)
            .map_err(|e| ConfigError::ValidationError(format!("{}", e)))?;

        Ok(serde_json::from_value(value)?)
    }

    fn schema_json() -> Result<String> {
        let schema = schemars::schema_for!(Self);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[schemars(title = "Scripting Client Configuration")]
#[schemars(description = "Configuration for the headless scripting client")]
pub struct ClientConfig {
    /// Address of the remote peer
    #[serde(default = "default_server_addr")]
    #[schemars(description = "Address of the game server as host:port")]
    #[schemars(regex(pattern = r"^[^:\s]+:\d{1,5}$"))]
    pub server_addr: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[schemars(description = "Log level: trace, debug, info, warn, error")]
    #[schemars(regex(pattern = r"^(trace|debug|info|warn|error)$"))]
    pub log_level: String,

    #[serde(default)]
    #[schemars(description = "Remote procedure call timeout and retries")]
    pub rpc: RpcConfig,

    #[serde(default)]
    #[schemars(description = "Connection settings")]
    pub session: SessionConfig,

    #[serde(default)]
    #[schemars(description = "Entity pool settings")]
    pub pools: PoolConfig,
}

fn default_server_addr() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            log_level: default_log_level(),
            rpc: RpcConfig::default(),
            session: SessionConfig::default(),
            pools: PoolConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Schema guarantees one of the five names; anything else falls back to INFO
    pub fn level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    pub fn core(&self) -> CoreConfig {
        CoreConfig {
            rpc: self.rpc.clone(),
            session: self.session.clone(),
            pools: self.pools.clone(),
        }
    }
}

impl Validatable for ClientConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.server_addr, "127.0.0.1:7777");
        assert_eq!(config.level(), Level::INFO);
        assert_eq!(config.core().rpc.timeout_ms, 10_000);
    }

    #[test]
    fn test_valid_json() {
        let json = r#"{
            "server_addr": "play.example.com:22005",
            "log_level": "debug",
            "rpc": { "timeout_ms": 2500, "max_retries": 2 },
            "session": { "max_frame_size": "1M" }
        }"#;

        let config = ClientConfig::from_json_str(json).unwrap();
        assert_eq!(config.server_addr, "play.example.com:22005");
        assert_eq!(config.level(), Level::DEBUG);
        assert_eq!(config.rpc.timeout_ms, 2500);
        assert_eq!(config.rpc.max_retries, 2);
        assert_eq!(config.session.max_frame_size.as_bytes(), 1024 * 1024);
        assert_eq!(config.session.unreliable_queue, 256);
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = ClientConfig::from_json_str("{}").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.pools.spatial_cell_size, 64.0);
    }

    #[test]
    fn test_invalid_log_level() {
        let result = ClientConfig::from_json_str(r#"{ "log_level": "verbose" }"#);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_invalid_server_addr() {
        let result = ClientConfig::from_json_str(r#"{ "server_addr": "no-port" }"#);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let result = ClientConfig::from_json_str(r#"{ "rpc": { "timeout_ms": -5 } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_schema_mentions_sections() {
        let schema = ClientConfig::schema_json().unwrap();
        assert!(schema.contains("Scripting Client Configuration"));
        assert!(schema.contains("max_frame_size"));
    }
}
