/// Daemon configuration
use crate::errors::{DaemonError, DaemonResult};
use agentlink_core::HubConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub hub: HubConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket bind address
    pub host: String,
    /// WebSocket port (0 picks an ephemeral port)
    pub port: u16,
    /// Enable metrics endpoint
    pub enable_metrics: bool,
    /// Metrics port
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_metrics: false,
            metrics_port: 9090,
        }
    }
}

/// Which channel store backs the hub
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// In-process store; no cross-instance fan-out
    Memory,
}

/// Channel store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: StoreBackend::Redis,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl StoreConfig {
    /// Connection description for the Redis backend.
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.db,
                password: self.password.clone().filter(|p| !p.is_empty()),
                ..Default::default()
            },
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DaemonError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from TOML file or use defaults
    pub fn load_or_default(path: Option<&Path>) -> DaemonResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> DaemonResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaemonError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> DaemonResult<()> {
        if self.server.enable_metrics
            && self.server.port != 0
            && self.server.port == self.server.metrics_port
        {
            return Err(DaemonError::Config(
                "server.port and server.metrics_port must differ".to_string(),
            ));
        }

        if self.server.host.trim().is_empty() {
            return Err(DaemonError::Config("server.host must not be empty".to_string()));
        }

        if self.store.backend == StoreBackend::Redis && self.store.port == 0 {
            return Err(DaemonError::Config("store.port must be non-zero".to_string()));
        }

        self.hub
            .validate()
            .map_err(|e| DaemonError::Config(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.hub.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn test_config_validation_port_clash() {
        let mut config = DaemonConfig::default();
        config.server.enable_metrics = true;
        config.server.metrics_port = config.server.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_zero_interval() {
        let mut config = DaemonConfig::default();
        config.hub.reconnect_interval_ms = 0;
        assert!(matches!(config.validate(), Err(DaemonError::Config(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9000

[store]
backend = "memory"

[hub]
heartbeat_interval_ms = 1000
dead_letter_enabled = true

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.hub.heartbeat_interval_ms, 1000);
        assert_eq!(config.hub.reconnect_interval_ms, 5000);
        assert!(config.hub.dead_letter_enabled);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = DaemonConfig::default();
        config.store.password = Some("secret".to_string());
        config.hub.subscribe_patterns = vec!["task:*".to_string()];

        let parsed: DaemonConfig = toml::from_str(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(DaemonConfig::load("/nonexistent/agentlink.toml").is_err());
        assert_eq!(DaemonConfig::load_or_default(None).unwrap(), DaemonConfig::default());
    }

    #[test]
    fn test_redis_connection_info() {
        let mut store = StoreConfig::default();
        let info = store.connection_info();
        assert_eq!(info.addr, redis::ConnectionAddr::Tcp("127.0.0.1".to_string(), 6379));
        assert_eq!(info.redis.db, 0);
        assert!(info.redis.password.is_none());

        store.password = Some("p@ss/w:rd".to_string());
        store.db = 2;
        let info = store.connection_info();
        assert_eq!(info.redis.password.as_deref(), Some("p@ss/w:rd"));
        assert_eq!(info.redis.db, 2);

        store.password = Some(String::new());
        assert!(store.connection_info().redis.password.is_none());
    }
}
