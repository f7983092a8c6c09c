//! Configuration for the runner.

use std::collections::HashMap;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the runner.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub runner: RunnerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub instances: InstancesConfig,
    #[serde(default)]
    pub filestore: FilestoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    pub id: String,
    /// Advertised in heartbeats for placement decisions.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Total GPU memory in bytes. Override for hosts where detection is
    /// not wired up.
    #[serde(default = "default_total_memory")]
    pub total_memory: u64,
}

/// Where the control plane lives.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default)]
    pub token: String,
    /// Timeout for poll and response uploads, in seconds.
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            token: String::new(),
            timeout_secs: default_api_timeout(),
        }
    }
}

/// The local HTTP server child processes pull tasks from.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstancesConfig {
    /// Idle instances are evicted after this many seconds of inactivity.
    #[serde(default = "default_instance_timeout")]
    pub timeout_secs: u64,
    /// Supervisor tick period in milliseconds.
    #[serde(default = "default_poll_period")]
    pub poll_period_ms: u64,
    /// How often runner state is reported to the control plane.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Directory for per-instance workspaces.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    /// Directory containing the model runtime scripts.
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_instance_timeout(),
            poll_period_ms: default_poll_period(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            workspace_dir: default_workspace_dir(),
            models_dir: default_models_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilestoreConfig {
    /// Root of the local filestore mirror.
    #[serde(default = "default_filestore_root")]
    pub root: String,
}

impl Default for FilestoreConfig {
    fn default() -> Self {
        Self {
            root: default_filestore_root(),
        }
    }
}

// Defaults
fn default_total_memory() -> u64 {
    24 * 1024 * 1024 * 1024
}
fn default_api_host() -> String {
    "http://localhost:8844".to_string()
}
fn default_api_timeout() -> u64 {
    5
}
fn default_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    8845
}
fn default_instance_timeout() -> u64 {
    300
}
fn default_poll_period() -> u64 {
    100
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_workspace_dir() -> String {
    "./workspace".to_string()
}
fn default_models_dir() -> String {
    "./models".to_string()
}
fn default_filestore_root() -> String {
    "./filestore".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (RUNNER__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("RUNNER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// The local URL a child process pops tasks from; the instance ID gets
    /// appended by each model instance.
    pub fn next_task_url(&self) -> String {
        format!(
            "http://{}:{}/api/v1/worker/task",
            self.server.host, self.server.port
        )
    }

    /// Read-only sibling of [`Config::next_task_url`].
    pub fn initial_session_url(&self) -> String {
        format!(
            "http://{}:{}/api/v1/worker/initial_session",
            self.server.host, self.server.port
        )
    }
}
