//! Configuration structures for Triage
//!
//! Configurations are loaded from YAML files and can be overridden by
//! `TRIAGE__SECTION__KEY` environment variables. Every section has defaults,
//! so an empty file (or no file at all) yields a runnable single-GPU setup.

use crate::error::{Result, TriageError};
use crate::types::{AgentType, BackendKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the config file path
pub const CONFIG_PATH_ENV: &str = "TRIAGE_CONFIG";

/// Top-level configuration for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageConfig {
    /// Task queue admission and bookkeeping
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker pool and batching
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// GPU telemetry sampling
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Load-balancing decisions
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Backend HTTP calls
    #[serde(default)]
    pub backend: BackendConfig,

    /// Registered model instances
    #[serde(default = "default_models")]
    pub models: Vec<ModelConfig>,

    /// Static agent type -> model name registry
    #[serde(default = "default_agents")]
    pub agents: HashMap<AgentType, String>,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued tasks before admission is rejected
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Response cache lifetime
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,

    /// Deadline applied to tasks that do not set one
    #[serde(default = "default_task_timeout")]
    pub default_timeout_seconds: u64,

    /// Retry budget applied to new tasks
    #[serde(default = "default_retries")]
    pub default_retries: u32,

    /// Number of completions kept for latency/throughput smoothing
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,

    /// Terminal tasks older than this are removed by the maintenance sweep
    #[serde(default = "default_cleanup_max_age")]
    pub cleanup_max_age_secs: u64,
}

/// Worker pool and batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Number of concurrent worker loops
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// How long an idle worker waits for a wakeup before polling again
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Whether the batch former runs alongside single-task workers
    #[serde(default = "default_batching_enabled")]
    pub batching_enabled: bool,

    /// Maximum batch size
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Batching window in milliseconds
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Interval of the timeout sweep / cleanup loop
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

/// Telemetry source selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TelemetrySourceKind {
    /// Shell out to the GPU query tool
    NvidiaSmi,

    /// Report a fixed state (CPU-only hosts, tests)
    Static,
}

impl Default for TelemetrySourceKind {
    fn default() -> Self {
        TelemetrySourceKind::NvidiaSmi
    }
}

/// Fixed GPU state reported by the static telemetry source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticStateConfig {
    pub total_gb: f64,
    pub used_gb: f64,
    pub temperature_c: f64,
    pub power_draw_w: f64,
}

impl Default for StaticStateConfig {
    fn default() -> Self {
        Self {
            total_gb: 24.0,
            used_gb: 8.0,
            temperature_c: 55.0,
            power_draw_w: 120.0,
        }
    }
}

/// Resource monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub source: TelemetrySourceKind,

    /// Executable producing the CSV telemetry line
    #[serde(default = "default_gpu_query_command")]
    pub gpu_query_command: String,

    /// Upper bound on a single telemetry query
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Background sampling interval
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    /// Ring buffer capacity
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Total memory assumed when telemetry is unavailable
    #[serde(default = "default_fallback_total_gb")]
    pub fallback_total_gb: f64,

    #[serde(default)]
    pub static_state: StaticStateConfig,
}

/// Utilization thresholds (percent) for each pressure tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PressureThresholds {
    pub low: f64,
    pub normal: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            low: 50.0,
            normal: 70.0,
            high: 85.0,
            critical: 95.0,
        }
    }
}

/// Decision engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Memory kept free on top of a model's VRAM footprint
    #[serde(default = "default_safety_margin")]
    pub safety_margin_gb: f64,

    /// Above this temperature only the smallest model is used
    #[serde(default = "default_temperature_limit")]
    pub temperature_limit_c: f64,

    /// Weight of the newest latency sample in the EMA
    #[serde(default = "default_ema_weight")]
    pub ema_weight: f64,

    /// Response length assumed by the duration heuristic
    #[serde(default = "default_response_tokens")]
    pub response_tokens: u32,

    /// Available memory required before the throughput backend is chosen
    #[serde(default = "default_throughput_min_available")]
    pub throughput_min_available_gb: f64,

    #[serde(default)]
    pub pressure_thresholds: PressureThresholds,
}

/// Backend HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Scheme and host of the serving processes; the model port is appended
    #[serde(default = "default_backend_host")]
    pub host: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Attempts per generation before degrading to a stub
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff unit after a timeout, multiplied by the attempt number
    #[serde(default = "default_timeout_backoff_ms")]
    pub timeout_backoff_ms: u64,

    /// Flat backoff after any other error
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default)]
    pub frequency_penalty: f32,

    #[serde(default)]
    pub presence_penalty: f32,
}

/// A registered model instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Model name/identifier
    pub name: String,

    /// Backend the instance is deployed on
    pub backend: BackendKind,

    /// Backends this model can be served by (always includes `backend`)
    #[serde(default)]
    pub supported_backends: Vec<BackendKind>,

    /// GPU memory footprint
    pub vram_gb: f64,

    /// Port of the serving process
    pub port: u16,

    /// Maximum context length
    #[serde(default = "default_context_tokens")]
    pub context_tokens: usize,

    /// Optional bearer credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Host override for instances not on the default backend host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, backend: BackendKind, vram_gb: f64, port: u16) -> Self {
        Self {
            name: name.into(),
            backend,
            supported_backends: vec![backend],
            vram_gb,
            port,
            context_tokens: default_context_tokens(),
            api_key: None,
            host: None,
        }
    }

    pub fn with_backends(mut self, backends: &[BackendKind]) -> Self {
        self.supported_backends = backends.to_vec();
        if !self.supported_backends.contains(&self.backend) {
            self.supported_backends.push(self.backend);
        }
        self
    }

    pub fn with_context(mut self, context_tokens: usize) -> Self {
        self.context_tokens = context_tokens;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Whether this model can be served by `backend`
    pub fn supports(&self, backend: BackendKind) -> bool {
        self.backend == backend || self.supported_backends.contains(&backend)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default = "default_structured_logging")]
    pub structured_logging: bool,
}

/// Default value functions
fn default_max_queue_size() -> usize {
    1000
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_task_timeout() -> u64 {
    300
}

fn default_retries() -> u32 {
    3
}

fn default_stats_window() -> usize {
    100
}

fn default_cleanup_max_age() -> u64 {
    3600
}

fn default_num_workers() -> usize {
    4
}

fn default_idle_poll_ms() -> u64 {
    100
}

fn default_batching_enabled() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    4
}

fn default_batch_window_ms() -> u64 {
    50
}

fn default_maintenance_interval() -> u64 {
    10
}

fn default_gpu_query_command() -> String {
    "nvidia-smi".to_string()
}

fn default_query_timeout() -> u64 {
    5
}

fn default_sample_interval() -> u64 {
    5
}

fn default_history_size() -> usize {
    100
}

fn default_fallback_total_gb() -> f64 {
    24.0
}

fn default_safety_margin() -> f64 {
    3.0
}

fn default_temperature_limit() -> f64 {
    80.0
}

fn default_ema_weight() -> f64 {
    0.3
}

fn default_response_tokens() -> u32 {
    512
}

fn default_throughput_min_available() -> f64 {
    10.0
}

fn default_backend_host() -> String {
    "http://127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_backoff_ms() -> u64 {
    1000
}

fn default_error_backoff_ms() -> u64 {
    500
}

fn default_top_p() -> f32 {
    0.95
}

fn default_context_tokens() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_structured_logging() -> bool {
    false
}

fn default_models() -> Vec<ModelConfig> {
    vec![
        ModelConfig::new("clinical-8b", BackendKind::Vllm, 16.0, 8001)
            .with_backends(&[BackendKind::LlamaCpp])
            .with_context(8192),
        ModelConfig::new("billing-3b", BackendKind::LlamaCpp, 6.0, 8002)
            .with_backends(&[BackendKind::Vllm]),
        ModelConfig::new("pharma-7b", BackendKind::Vllm, 14.0, 8003).with_context(8192),
        ModelConfig::new("translate-4b", BackendKind::LlamaCpp, 8.0, 8004)
            .with_backends(&[BackendKind::Vllm]),
        ModelConfig::new("general-1b", BackendKind::LlamaCpp, 1.5, 8005).with_context(2048),
    ]
}

fn default_agents() -> HashMap<AgentType, String> {
    [
        (AgentType::Clinical, "clinical-8b"),
        (AgentType::Radiology, "clinical-8b"),
        (AgentType::Billing, "billing-3b"),
        (AgentType::Claims, "billing-3b"),
        (AgentType::Pharmacy, "pharma-7b"),
        (AgentType::Translation, "translate-4b"),
        (AgentType::General, "general-1b"),
    ]
    .into_iter()
    .map(|(agent, model)| (agent, model.to_string()))
    .collect()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            cache_ttl_seconds: default_cache_ttl(),
            default_timeout_seconds: default_task_timeout(),
            default_retries: default_retries(),
            stats_window: default_stats_window(),
            cleanup_max_age_secs: default_cleanup_max_age(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            idle_poll_ms: default_idle_poll_ms(),
            batching_enabled: default_batching_enabled(),
            max_batch_size: default_max_batch_size(),
            batch_window_ms: default_batch_window_ms(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            source: TelemetrySourceKind::default(),
            gpu_query_command: default_gpu_query_command(),
            query_timeout_secs: default_query_timeout(),
            sample_interval_secs: default_sample_interval(),
            history_size: default_history_size(),
            fallback_total_gb: default_fallback_total_gb(),
            static_state: StaticStateConfig::default(),
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            safety_margin_gb: default_safety_margin(),
            temperature_limit_c: default_temperature_limit(),
            ema_weight: default_ema_weight(),
            response_tokens: default_response_tokens(),
            throughput_min_available_gb: default_throughput_min_available(),
            pressure_thresholds: PressureThresholds::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            timeout_backoff_ms: default_timeout_backoff_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: default_structured_logging(),
        }
    }
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            dispatcher: DispatcherConfig::default(),
            monitor: MonitorConfig::default(),
            balancer: BalancerConfig::default(),
            backend: BackendConfig::default(),
            models: default_models(),
            agents: default_agents(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl TriageConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            TriageError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: TriageConfig = serde_yaml::from_str(&content).map_err(|e| {
            TriageError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with environment overrides
    ///
    /// `TRIAGE__QUEUE__MAX_QUEUE_SIZE=50` overrides `queue.max_queue_size`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("TRIAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TriageError::Config(format!("Failed to load configuration: {}", e)))?;

        let config: TriageConfig = settings
            .try_deserialize()
            .map_err(|e| TriageError::Config(format!("Invalid configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load using the path in `TRIAGE_CONFIG`, if set
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(Some(Path::new(&path))),
            Err(_) => Self::load(None),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(TriageError::config("At least one model must be registered"));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                return Err(TriageError::config(format!("Duplicate model name: {}", model.name)));
            }
            let host = model.host.as_deref().unwrap_or(&self.backend.host);
            if !ports.insert((host, model.port)) {
                return Err(TriageError::config(format!(
                    "Duplicate port {} for model {}",
                    model.port, model.name
                )));
            }
            if model.vram_gb <= 0.0 {
                return Err(TriageError::config(format!(
                    "Model {} must declare a positive vram_gb",
                    model.name
                )));
            }
        }

        for (agent, model) in &self.agents {
            if !names.contains(model.as_str()) {
                return Err(TriageError::config(format!(
                    "Agent {} is mapped to unregistered model {}",
                    agent, model
                )));
            }
        }

        if self.queue.max_queue_size == 0 {
            return Err(TriageError::config("queue.max_queue_size must be positive"));
        }

        if self.dispatcher.num_workers == 0 || self.dispatcher.max_batch_size == 0 {
            return Err(TriageError::config(
                "dispatcher.num_workers and dispatcher.max_batch_size must be positive",
            ));
        }

        if self.monitor.sample_interval_secs == 0 {
            return Err(TriageError::config("monitor.sample_interval_secs must be positive"));
        }
        if self.monitor.query_timeout_secs == 0 {
            return Err(TriageError::config("monitor.query_timeout_secs must be positive"));
        }

        let t = &self.balancer.pressure_thresholds;
        if !(t.low < t.normal && t.normal < t.high && t.high < t.critical) {
            return Err(TriageError::config("Pressure thresholds must be strictly ascending"));
        }

        if !(self.balancer.ema_weight > 0.0 && self.balancer.ema_weight <= 1.0) {
            return Err(TriageError::config("balancer.ema_weight must be in (0, 1]"));
        }

        Ok(())
    }

    /// Look up a registered model by name
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }
}
