//! Dispatch core settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The `[reef]` section of the runner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReefConfig {
    /// Name used in logs.
    #[serde(default = "default_name")]
    pub name: String,

    /// Channel used by `broadcast` and auto-rebroadcast.
    #[serde(default = "default_channel")]
    pub default_channel: String,

    /// How long the in-flight count must stay at zero before the reef is
    /// considered quiescent.
    #[serde(default = "default_quiescence_grace_ms")]
    pub quiescence_grace_ms: u64,

    /// Upper bound on the drain performed by `shutdown(true)`.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Spores kept per channel for inspection.
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_name() -> String {
    "reef".to_string()
}

fn default_channel() -> String {
    "main".to_string()
}

fn default_quiescence_grace_ms() -> u64 {
    100
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_channel_buffer() -> usize {
    100
}

impl Default for ReefConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            default_channel: default_channel(),
            quiescence_grace_ms: default_quiescence_grace_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

impl ReefConfig {
    pub fn quiescence_grace(&self) -> Duration {
        Duration::from_millis(self.quiescence_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
