//! Engine configuration types.
//!
//! `EngineConfig` represents a `conveyor.toml` file controlling default
//! timeouts, the default retry policy and logging. All fields have defaults,
//! so an empty file is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-step timeout in seconds. Absent means no per-step limit.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,

    /// Whole-run timeout in seconds. Absent means no run limit.
    #[serde(default)]
    pub global_timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: None,
            global_timeout_secs: None,
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Backoff shape for the default retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Never retry.
    None,
    #[default]
    Fixed,
    Exponential,
}

/// Default retry policy attached to every step that does not set its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Total attempts, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay, or the initial delay for exponential backoff.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Upper bound for exponential backoff.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

fn default_max_retries() -> u32 {
    1
}

fn default_delay_ms() -> u64 {
    200
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            max_retries: default_max_retries(),
            delay_ms: default_delay_ms(),
            max_delay_ms: None,
        }
    }
}

/// Logging configuration consumed by the tracing setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            otel: false,
        }
    }
}
