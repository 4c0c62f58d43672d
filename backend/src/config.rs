//! Configuration for the balancer and autoscaler.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    /// Fallback used while no worker is available.
    #[serde(default)]
    pub cold_start: Option<ColdStartConfig>,
    #[serde(default)]
    pub admin: AdminConfig,
    /// Worker process template. Without it the autoscaler has nothing to
    /// spawn and workers must be pushed through `/system/update-servers`.
    #[serde(default)]
    pub worker: Option<WorkerProcessConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Batching and dispatch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BalancerConfig {
    /// REST path clients submit to, also the path called on workers.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Number of requests processed by a worker at once.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Seconds to wait for a batch to fill before sending a partial one.
    #[serde(default = "default_timeout_batching")]
    pub timeout_batching_secs: f64,
    /// Seconds to wait for a worker to answer a batch.
    #[serde(default = "default_timeout_inference")]
    pub timeout_inference_secs: u64,
    /// How often the flush loop inspects the queue.
    #[serde(default = "default_poll_interval_ms")]
    pub flush_interval_ms: u64,
    /// How often a waiting caller checks the response registry.
    #[serde(default = "default_poll_interval_ms")]
    pub response_poll_interval_ms: u64,
    /// Maximum number of cold-start answered ids remembered.
    #[serde(default = "default_cold_start_capacity")]
    pub cold_start_capacity: usize,
}

impl BalancerConfig {
    /// Unusable values (negative, NaN, infinite) collapse to zero.
    pub fn timeout_batching(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_batching_secs).unwrap_or_default()
    }

    pub fn timeout_inference(&self) -> Duration {
        Duration::from_secs(self.timeout_inference_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn response_poll_interval(&self) -> Duration {
        Duration::from_millis(self.response_poll_interval_ms.max(1))
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_batch_size: default_max_batch_size(),
            timeout_batching_secs: default_timeout_batching(),
            timeout_inference_secs: default_timeout_inference(),
            flush_interval_ms: default_poll_interval_ms(),
            response_poll_interval_ms: default_poll_interval_ms(),
            cold_start_capacity: default_cold_start_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoscalerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Workers started at boot and the floor for scale-in.
    #[serde(default = "default_min_replicas")]
    pub min_replicas: usize,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: usize,
    /// Seconds between scaling decisions.
    #[serde(default = "default_autoscale_interval")]
    pub autoscale_interval_secs: u64,
    /// Drive a balancer running elsewhere instead of the in-process one.
    #[serde(default)]
    pub balancer_url: Option<String>,
}

impl AutoscalerConfig {
    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_secs(self.autoscale_interval_secs)
    }
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_replicas: default_min_replicas(),
            max_replicas: default_max_replicas(),
            autoscale_interval_secs: default_autoscale_interval(),
            balancer_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColdStartConfig {
    pub proxy_url: String,
    #[serde(default = "default_cold_start_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdminConfig {
    /// Shared secret for `/system/*`. Unset means unauthenticated.
    #[serde(default)]
    pub auth_secret: Option<String>,
}

/// Template for spawning one worker process per replica.
///
/// `{host}` and `{port}` in `args` are replaced with the worker's bind
/// address.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerProcessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_worker_host")]
    pub host: String,
    /// First port to hand out. If not set, the OS assigns ports.
    #[serde(default)]
    pub base_port: Option<u16>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Inherit worker stdout/stderr.
    #[serde(default)]
    pub log_output: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_endpoint() -> String {
    "/predict".to_string()
}
fn default_max_batch_size() -> usize {
    8
}
fn default_timeout_batching() -> f64 {
    1.0
}
fn default_timeout_inference() -> u64 {
    60
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_cold_start_capacity() -> usize {
    100_000
}
fn default_true() -> bool {
    true
}
fn default_min_replicas() -> usize {
    1
}
fn default_max_replicas() -> usize {
    4
}
fn default_autoscale_interval() -> u64 {
    10
}
fn default_cold_start_timeout() -> u64 {
    60
}
fn default_worker_host() -> String {
    "127.0.0.1".to_string()
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_startup_timeout() -> u64 {
    600
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Prefix a REST path with `/` if it lacks one.
pub fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with('/') {
        endpoint.to_string()
    } else {
        format!("/{}", endpoint)
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (AUTOBATCH__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration using `path` (without extension) as the optional file source.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("AUTOBATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.balancer.endpoint = normalize_endpoint(&config.balancer.endpoint);
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the balancer and autoscaler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.autoscaler.max_replicas < self.autoscaler.min_replicas {
            return Err(ConfigError::Message(format!(
                "`max_replicas={}` must be greater than or equal to `min_replicas={}`",
                self.autoscaler.max_replicas, self.autoscaler.min_replicas
            )));
        }
        if self.balancer.max_batch_size == 0 {
            return Err(ConfigError::Message(
                "`max_batch_size` must be at least 1".to_string(),
            ));
        }
        let timeout = self.balancer.timeout_batching_secs;
        if !timeout.is_finite() || timeout < 0.0 {
            return Err(ConfigError::Message(format!(
                "`timeout_batching_secs={}` must be a finite, non-negative number",
                timeout
            )));
        }
        if self.balancer.cold_start_capacity < 2 {
            return Err(ConfigError::Message(
                "`cold_start_capacity` must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}
