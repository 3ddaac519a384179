/// Hub configuration
use crate::errors::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the coordination hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Heartbeat tick in milliseconds; sessions silent for twice this are unhealthy
    pub heartbeat_interval_ms: u64,
    /// Reconnect interval in milliseconds; removal grace is twice this
    pub reconnect_interval_ms: u64,
    /// Expiry for buffered envelopes without their own ttl
    pub default_ttl_ms: u64,
    /// Store write retries after the first attempt
    pub max_retries: u32,
    /// Keep evicted and expired envelopes in a dead-letter queue
    pub dead_letter_enabled: bool,
    /// Per-agent offline buffer capacity
    pub buffer_batch_size: usize,
    /// Store subscription patterns
    pub subscribe_patterns: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            heartbeat_interval_ms: 30_000,
            reconnect_interval_ms: 5_000,
            default_ttl_ms: 300_000,
            max_retries: 3,
            dead_letter_enabled: false,
            buffer_batch_size: 100,
            subscribe_patterns: vec!["*:*".to_string()],
        }
    }
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a connected session is flagged.
    pub fn unhealthy_after(&self) -> Duration {
        self.heartbeat_interval() * 2
    }

    /// How long disconnected or errored sessions stay listed.
    pub fn removal_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms) * 2
    }

    pub fn validate(&self) -> HubResult<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(HubError::Config(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.reconnect_interval_ms == 0 {
            return Err(HubError::Config(
                "reconnect_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.default_ttl_ms == 0 {
            return Err(HubError::Config("default_ttl_ms must be greater than 0".to_string()));
        }

        if self.buffer_batch_size == 0 {
            return Err(HubError::Config(
                "buffer_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.subscribe_patterns.is_empty() {
            return Err(HubError::Config(
                "At least one subscribe pattern is required".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.unhealthy_after(), Duration::from_secs(60));
        assert_eq!(config.removal_grace(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = HubConfig::default();
        config.heartbeat_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.buffer_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.subscribe_patterns.clear();
        assert!(config.validate().is_err());
    }
}
