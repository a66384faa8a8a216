//! Lobby configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Timeouts, retry and migration policy for one [`crate::Lobby`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbyConfig {
    /// Deadline for one mutating backend call.
    pub operation_timeout_ms: u64,
    /// Retries after a timeout before the session fails.
    pub max_retries: u32,
    /// First retry delay, doubled per attempt.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Deadline for a search. Searches are not retried.
    pub search_timeout_ms: u64,
    /// Pause between promotion candidates and between busy-slot polls.
    pub migration_retry_delay_ms: u64,
    pub migration_busy_attempts: u32,
    /// Overrides the backend's advertised search-by-id support.
    pub find_by_id_supported: Option<bool>,
    /// Search passes a matchmaking run makes before it hosts.
    pub matchmaking_search_attempts: u32,
    /// Pause between matchmaking search passes.
    pub matchmaking_restart_delay_ms: u64,
    /// Head start given to a reconnecting host before clients search.
    pub reconnect_delay_ms: u64,
    pub reconnect_search_attempts: u32,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 10_000,
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            search_timeout_ms: 20_000,
            migration_retry_delay_ms: 100,
            migration_busy_attempts: 50,
            find_by_id_supported: None,
            matchmaking_search_attempts: 3,
            matchmaking_restart_delay_ms: 2_000,
            reconnect_delay_ms: 1_000,
            reconnect_search_attempts: 5,
        }
    }
}

impl LobbyConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operation_timeout_ms == 0 || self.search_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.matchmaking_search_attempts == 0 || self.reconnect_search_attempts == 0 {
            return Err(ConfigError::Invalid("search attempts must be at least 1".into()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn migration_retry_delay(&self) -> Duration {
        Duration::from_millis(self.migration_retry_delay_ms)
    }

    pub fn matchmaking_restart_delay(&self) -> Duration {
        Duration::from_millis(self.matchmaking_restart_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Delay before retry `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}
