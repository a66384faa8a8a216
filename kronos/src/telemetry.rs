//! Tracing subscriber setup for hosts embedding a lobby.
//!
//! # Example
//!
//! ```rust,ignore
//! use kronos::telemetry::{init_tracing, TracingConfig};
//!
//! init_tracing(TracingConfig::new("my-game").with_level("kronos=debug,info"));
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing configuration.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Recorded on the startup line.
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset (e.g. "info", "kronos=debug").
    pub log_level: String,
    /// Output logs as JSON.
    pub json_output: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "kronos".into(),
            log_level: "info".into(),
            json_output: false,
        }
    }
}

impl TracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(config: TracingConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if config.json_output {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        registry.with(fmt_layer).try_init().is_ok()
    } else {
        let fmt_layer = fmt::layer().with_target(true).compact();
        registry.with(fmt_layer).try_init().is_ok()
    };

    if installed {
        tracing::info!(service = %config.service_name, json = config.json_output, "tracing initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = TracingConfig::new("lobby-host").with_level("kronos=debug").with_json();
        assert_eq!(config.service_name, "lobby-host");
        assert_eq!(config.log_level, "kronos=debug");
        assert!(config.json_output);
    }

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.service_name, "kronos");
        assert_eq!(config.log_level, "info");
        assert!(!config.json_output);
    }
}
