//! Tracing subscriber setup for hosts embedding the loom runtime.

use loom_settings::LoggingSettings;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default filter directive. Overridden by the `RUST_LOG` env var.
    pub level: String,
    /// Per-module directives (e.g. `loom_runtime` => `debug`).
    pub module_levels: Vec<(String, String)>,
    /// Emit JSON lines instead of compact human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl From<&LoggingSettings> for TelemetryConfig {
    fn from(settings: &LoggingSettings) -> Self {
        Self {
            level: settings.level.clone(),
            module_levels: Vec::new(),
            json: settings.json,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string built from the level and module overrides.
    pub fn directives(&self) -> String {
        let mut filter = self.level.to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_lowercase()));
        }
        filter
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Install the global subscriber, writing to stderr.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.directives())
            .map_err(|e| TelemetryError::Filter(e.to_string()))?,
    };

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_levels() {
        let config = TelemetryConfig {
            level: "WARN".into(),
            module_levels: vec![("loom_runtime".into(), "DEBUG".into())],
            json: false,
        };
        assert_eq!(config.directives(), "warn,loom_runtime=debug");
    }

    #[test]
    fn from_logging_settings() {
        let settings = LoggingSettings {
            level: "trace".into(),
            json: true,
        };
        let config = TelemetryConfig::from(&settings);
        assert_eq!(config.level, "trace");
        assert!(config.json);
    }

    #[test]
    fn second_init_reports_already_initialized() {
        let config = TelemetryConfig::default();
        let first = init_logging(&config);
        let second = init_logging(&config);
        // Another test binary thread may have installed one first; either way
        // the second call can never succeed.
        assert!(first.is_ok() || matches!(first, Err(TelemetryError::AlreadyInitialized)));
        assert!(matches!(second, Err(TelemetryError::AlreadyInitialized)));
    }
}
