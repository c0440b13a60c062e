//! Runner configuration loading from file and environment variables.

use reef_backend::BackendConfig;
use reef_core::ReefConfig;
use reef_trace::{ObservabilityConfig, TraceError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level runner configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Dispatch core settings.
    #[serde(default)]
    pub reef: ReefConfig,

    /// Transport settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Tracing settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "reef_core=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The observability section is out of range.
    #[error(transparent)]
    Observability(#[from] TraceError),
}

impl RunnerConfig {
    /// Applies environment overrides read through `lookup`.
    ///
    /// - `REEF_BACKEND` overrides `backend.kind`
    /// - `REEF_AMQP_URL` overrides `backend.url`
    /// - `REEF_EXCHANGE` overrides `backend.exchange`
    /// - `REEF_LOG_LEVEL` overrides `logging.level`
    /// - `REEF_LOG_JSON` overrides `logging.json` (set to "true" to enable)
    /// - `OBSERVABILITY`, `SAMPLE_RATE`, `OTLP_ENDPOINT`, `TRACES_PATH` and
    ///   `ENVIRONMENT` override the observability section
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for an unknown backend and `Observability` for a bad
    /// observability value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kind) = lookup("REEF_BACKEND") {
            self.backend.kind = kind
                .parse()
                .map_err(|e: reef_backend::ParseBackendKindError| ConfigError::Invalid(e.to_string()))?;
        }
        if let Some(url) = lookup("REEF_AMQP_URL") {
            self.backend.url = url;
        }
        if let Some(exchange) = lookup("REEF_EXCHANGE") {
            self.backend.exchange = exchange;
        }
        if let Some(level) = lookup("REEF_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("REEF_LOG_JSON") {
            self.logging.json = json == "true" || json == "1";
        }
        self.observability.apply_env(&lookup)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Invalid` for an empty default channel or exchange, and
    /// `Observability` for an out-of-range sample rate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reef.default_channel.trim().is_empty() {
            return Err(ConfigError::Invalid("reef.default_channel is empty".into()));
        }
        if self.backend.exchange.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.exchange is empty".into()));
        }
        self.observability.validate()?;
        Ok(())
    }
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies the process environment (see [`RunnerConfig::apply_env`]).
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the result is invalid.
pub fn load_config(path: Option<&str>) -> Result<RunnerConfig, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                RunnerConfig::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => RunnerConfig::default(),
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_backend::BackendKind;
    use reef_trace::EnableMode;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    // ── file loading ─────────────────────────────────────────────────

    #[test]
    fn missing_path_yields_defaults() {
        let config = load_config(Some("/nonexistent/reef.toml")).expect("should fall back");
        assert_eq!(config.reef.default_channel, "main");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_all_sections() {
        let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
        write!(
            file,
            r#"
[reef]
name = "research"
quiescence_grace_ms = 50

[backend]
kind = "amqp"
exchange = "research.agents"

[observability]
enabled = "on"
sample_rate = 0.5
traces_path = "/tmp/reef-traces.db"

[logging]
level = "debug"
json = true
"#
        )
        .expect("should write config");

        let config: RunnerConfig = toml::from_str(
            &std::fs::read_to_string(file.path()).expect("should read back"),
        )
        .expect("should parse");
        assert_eq!(config.reef.name, "research");
        assert_eq!(config.reef.quiescence_grace_ms, 50);
        assert_eq!(config.backend.kind, BackendKind::Amqp);
        assert_eq!(config.backend.exchange, "research.agents");
        assert_eq!(config.observability.enabled, EnableMode::On);
        assert!((config.observability.sample_rate - 0.5).abs() < f64::EPSILON);
        assert!(config.logging.json);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<RunnerConfig>("[reef]\nname = \"a\"\nspeed = 3\n").is_err());
        assert!(toml::from_str::<RunnerConfig>("[extras]\nx = 1\n").is_err());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
        write!(file, "[reef\nname = ").expect("should write");
        let path = file.path().to_str().expect("temp path should be utf-8");
        assert!(matches!(load_config(Some(path)), Err(ConfigError::Parse(_))));
    }

    // ── environment overrides ────────────────────────────────────────

    #[test]
    fn env_overrides_file_values() {
        let mut config = RunnerConfig::default();
        config
            .apply_env(env(&[
                ("REEF_BACKEND", "amqp"),
                ("REEF_AMQP_URL", "amqp://broker:5672/%2f"),
                ("REEF_EXCHANGE", "lab"),
                ("REEF_LOG_LEVEL", "warn"),
                ("REEF_LOG_JSON", "1"),
                ("OBSERVABILITY", "off"),
                ("SAMPLE_RATE", "0.25"),
            ]))
            .expect("should apply");

        assert_eq!(config.backend.kind, BackendKind::Amqp);
        assert_eq!(config.backend.url, "amqp://broker:5672/%2f");
        assert_eq!(config.backend.exchange, "lab");
        assert_eq!(config.logging.level, "warn");
        assert!(config.logging.json);
        assert_eq!(config.observability.enabled, EnableMode::Off);
        assert!((config.observability.sample_rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let mut config = RunnerConfig::default();
        assert!(matches!(
            config.apply_env(env(&[("REEF_BACKEND", "carrier-pigeon")])),
            Err(ConfigError::Invalid(_))
        ));
        let mut config = RunnerConfig::default();
        assert!(matches!(
            config.apply_env(env(&[("SAMPLE_RATE", "1.5")])),
            Err(ConfigError::Observability(_))
        ));
    }
}
