//! Observability configuration.

use serde::{Deserialize, Serialize};

use crate::error::TraceError;

/// Default location of the span store.
pub const DEFAULT_TRACES_PATH: &str = "~/.reef/traces.db";

/// Whether tracing is switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnableMode {
    /// On in development, off in production.
    #[default]
    Auto,
    /// Always on.
    On,
    /// Always off.
    Off,
}

impl std::str::FromStr for EnableMode {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "on" | "true" | "1" => Ok(Self::On),
            "off" | "false" | "0" => Ok(Self::Off),
            other => Err(TraceError::Config(format!(
                "observability must be auto, on or off, got {other:?}"
            ))),
        }
    }
}

/// Deployment environment label consulted by [`EnableMode::Auto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// Parses an environment label. Only `production` / `prod` map to
    /// production; every other label counts as development.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }
}

/// Tracing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Enable mode.
    #[serde(default)]
    pub enabled: EnableMode,

    /// Fraction of root spans recorded, in `[0, 1]`.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// OTLP/HTTP collector base URL.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// SQLite span store path; `~` is expanded.
    #[serde(default = "default_traces_path")]
    pub traces_path: String,

    /// Deployment environment.
    #[serde(default)]
    pub environment: Environment,

    /// `service.name` reported to the OTLP collector.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_traces_path() -> String {
    DEFAULT_TRACES_PATH.to_string()
}

fn default_service_name() -> String {
    "reef".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: EnableMode::default(),
            sample_rate: default_sample_rate(),
            otlp_endpoint: None,
            traces_path: default_traces_path(),
            environment: Environment::default(),
            service_name: default_service_name(),
        }
    }
}

impl ObservabilityConfig {
    /// Defaults overridden by the process environment.
    ///
    /// # Errors
    ///
    /// Returns `TraceError::Config` for an unknown enable mode or an
    /// unparseable / out-of-range sample rate.
    pub fn from_env() -> Result<Self, TraceError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `OBSERVABILITY`, `SAMPLE_RATE`, `OTLP_ENDPOINT`,
    /// `TRACES_PATH` and `ENVIRONMENT` from `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`ObservabilityConfig::from_env`].
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), TraceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("OBSERVABILITY") {
            self.enabled = mode.parse()?;
        }
        if let Some(rate) = lookup("SAMPLE_RATE") {
            self.sample_rate = rate.trim().parse().map_err(|_| {
                TraceError::Config(format!("SAMPLE_RATE is not a number: {rate:?}"))
            })?;
        }
        if let Some(endpoint) = lookup("OTLP_ENDPOINT") {
            let endpoint = endpoint.trim();
            self.otlp_endpoint = (!endpoint.is_empty()).then(|| endpoint.to_string());
        }
        if let Some(path) = lookup("TRACES_PATH") {
            if !path.trim().is_empty() {
                self.traces_path = path;
            }
        }
        if let Some(environment) = lookup("ENVIRONMENT") {
            self.environment = Environment::from_label(&environment);
        }
        self.validate()
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `TraceError::Config` when `sample_rate` lies outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), TraceError> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(TraceError::Config(format!(
                "sample_rate must be within [0, 1], got {}",
                self.sample_rate
            )));
        }
        Ok(())
    }

    /// Resolves the enable mode against the environment.
    pub fn is_enabled(&self) -> bool {
        match self.enabled {
            EnableMode::On => true,
            EnableMode::Off => false,
            EnableMode::Auto => self.environment == Environment::Development,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.enabled, EnableMode::Auto);
        assert_eq!(config.sample_rate, 1.0);
        assert_eq!(config.traces_path, "~/.reef/traces.db");
        assert!(config.is_enabled());
    }

    #[test]
    fn auto_follows_environment() {
        let mut config = ObservabilityConfig::default();
        config
            .apply_env(lookup(&[("ENVIRONMENT", "production")]))
            .expect("env should apply");
        assert!(!config.is_enabled());

        config
            .apply_env(lookup(&[("OBSERVABILITY", "on")]))
            .expect("env should apply");
        assert!(config.is_enabled());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = ObservabilityConfig::default();
        config
            .apply_env(lookup(&[
                ("OBSERVABILITY", "off"),
                ("SAMPLE_RATE", "0.25"),
                ("OTLP_ENDPOINT", "http://collector:4318"),
                ("TRACES_PATH", "/tmp/reef/traces.db"),
            ]))
            .expect("env should apply");

        assert_eq!(config.enabled, EnableMode::Off);
        assert_eq!(config.sample_rate, 0.25);
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://collector:4318"));
        assert_eq!(config.traces_path, "/tmp/reef/traces.db");
    }

    #[test]
    fn out_of_range_sample_rate_is_rejected() {
        let mut config = ObservabilityConfig::default();
        let err = config
            .apply_env(lookup(&[("SAMPLE_RATE", "1.5")]))
            .expect_err("1.5 should be rejected");
        assert!(matches!(err, TraceError::Config(_)));

        let mut config = ObservabilityConfig::default();
        assert!(config.apply_env(lookup(&[("SAMPLE_RATE", "lots")])).is_err());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut config = ObservabilityConfig::default();
        assert!(config
            .apply_env(lookup(&[("OBSERVABILITY", "sometimes")]))
            .is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<ObservabilityConfig, _> =
            serde_json::from_str(r#"{"enabled": "on", "bogus": 1}"#);
        assert!(parsed.is_err());

        let parsed: ObservabilityConfig =
            serde_json::from_str(r#"{"enabled": "off", "sample_rate": 0.5}"#)
                .expect("known keys should parse");
        assert_eq!(parsed.enabled, EnableMode::Off);
        assert_eq!(parsed.traces_path, DEFAULT_TRACES_PATH);
    }
}
