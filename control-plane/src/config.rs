//! Control plane configuration.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration for the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub push: PushSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// Runners that stop polling are expired after this many seconds.
    #[serde(default = "default_runner_ttl")]
    pub runner_ttl_secs: u64,
    /// Bound on the per-runner and global decision rings.
    #[serde(default = "default_decision_ring")]
    pub decision_ring: usize,
    /// Only hand out sessions older than this (soft rate limit, 0 = off).
    #[serde(default)]
    pub min_age_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            runner_ttl_secs: default_runner_ttl(),
            decision_ring: default_decision_ring(),
            min_age_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushSettings {
    #[serde(default = "default_push_capacity")]
    pub capacity: usize,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            capacity: default_push_capacity(),
        }
    }
}

// Defaults
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8844
}
fn default_runner_ttl() -> u64 {
    60
}
fn default_decision_ring() -> usize {
    256
}
fn default_push_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            scheduler: SchedulerSettings::default(),
            push: PushSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from config.toml (if present) and environment
    /// variables. Env var format: CONTROL__SECTION__KEY
    /// (e.g. CONTROL__SCHEDULER__RUNNER_TTL_SECS).
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("host", default_host())?
            .set_default("port", default_port() as i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("CONTROL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
