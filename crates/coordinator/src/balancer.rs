//! Resource-aware model and backend selection
//!
//! Picks a model and serving backend for each generation from the live GPU
//! state, per-model latency/failure history and the pressure tier.

use crate::monitor::{GpuMemoryState, ResourceMonitor};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use triage_common::config::{BalancerConfig, ModelConfig, PressureThresholds};
use triage_common::{AgentType, BackendKind, Result, TriageConfig, TriageError, METRICS};

/// Models with more requests in flight than this get a score penalty
pub const BUSY_QUEUE_THRESHOLD: usize = 5;
const BUSY_PENALTY_MS: f64 = 50.0;
const FAILURE_PENALTY_MS: f64 = 100.0;

/// GPU memory pressure bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureTier {
    Low,
    Normal,
    High,
    Critical,
}

impl PressureTier {
    /// Smallest tier whose threshold covers `utilization_percent`, else critical
    pub fn classify(utilization_percent: f64, thresholds: &PressureThresholds) -> Self {
        [
            (PressureTier::Low, thresholds.low),
            (PressureTier::Normal, thresholds.normal),
            (PressureTier::High, thresholds.high),
            (PressureTier::Critical, thresholds.critical),
        ]
        .into_iter()
        .find(|(_, threshold)| utilization_percent <= *threshold)
        .map(|(tier, _)| tier)
        .unwrap_or(PressureTier::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PressureTier::Low => "low",
            PressureTier::Normal => "normal",
            PressureTier::High => "high",
            PressureTier::Critical => "critical",
        }
    }
}

impl fmt::Display for PressureTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// VRAM size class used for throughput estimates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Tiny,
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub fn from_vram(vram_gb: f64) -> Self {
        if vram_gb < 2.0 {
            SizeClass::Tiny
        } else if vram_gb < 8.0 {
            SizeClass::Small
        } else if vram_gb < 15.0 {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }

    /// Rough decode throughput in tokens per second
    pub fn tokens_per_second(&self, backend: BackendKind) -> f64 {
        match (self, backend) {
            (SizeClass::Tiny, BackendKind::Vllm) => 180.0,
            (SizeClass::Tiny, BackendKind::LlamaCpp) => 120.0,
            (SizeClass::Small, BackendKind::Vllm) => 90.0,
            (SizeClass::Small, BackendKind::LlamaCpp) => 60.0,
            (SizeClass::Medium, BackendKind::Vllm) => 50.0,
            (SizeClass::Medium, BackendKind::LlamaCpp) => 30.0,
            (SizeClass::Large, BackendKind::Vllm) => 25.0,
            (SizeClass::Large, BackendKind::LlamaCpp) => 12.0,
        }
    }
}

/// Live load information for one registered model
#[derive(Debug, Clone, Serialize)]
pub struct ModelLoadInfo {
    pub model_name: String,
    pub backend: BackendKind,
    pub vram_gb: f64,
    pub port: u16,
    /// Exponential moving average of observed latency
    pub avg_latency_ms: f64,
    pub latency_samples: u64,
    pub queue_size: usize,
    pub failure_count: u32,
    pub last_used: Option<DateTime<Utc>>,
}

impl ModelLoadInfo {
    pub fn new(model: &ModelConfig) -> Self {
        Self {
            model_name: model.name.clone(),
            backend: model.backend,
            vram_gb: model.vram_gb,
            port: model.port,
            avg_latency_ms: 0.0,
            latency_samples: 0,
            queue_size: 0,
            failure_count: 0,
            last_used: None,
        }
    }

    /// Ranking score, lower is better
    pub fn priority_score(&self) -> f64 {
        let busy = if self.queue_size > BUSY_QUEUE_THRESHOLD {
            BUSY_PENALTY_MS
        } else {
            0.0
        };
        self.avg_latency_ms + self.failure_count as f64 * FAILURE_PENALTY_MS + busy
    }
}

/// Outcome of one routing decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadBalancingDecision {
    pub model_name: String,
    pub backend: BackendKind,
    pub port: u16,
    pub reason: String,
    pub estimated_duration_ms: f64,
    pub will_exceed_memory: bool,
    pub pressure: PressureTier,
}

/// Chooses a model and backend for each request
pub struct DecisionEngine {
    monitor: Arc<ResourceMonitor>,
    config: BalancerConfig,
    specs: Vec<ModelConfig>,
    agents: HashMap<AgentType, String>,
    models: RwLock<HashMap<String, ModelLoadInfo>>,
}

impl DecisionEngine {
    pub fn new(monitor: Arc<ResourceMonitor>, config: &TriageConfig) -> Self {
        let models = config
            .models
            .iter()
            .map(|model| (model.name.clone(), ModelLoadInfo::new(model)))
            .collect();

        Self {
            monitor,
            config: config.balancer.clone(),
            specs: config.models.clone(),
            agents: config.agents.clone(),
            models: RwLock::new(models),
        }
    }

    pub fn pressure_tier(&self, utilization_percent: f64) -> PressureTier {
        PressureTier::classify(utilization_percent, &self.config.pressure_thresholds)
    }

    /// Registered model with the smallest VRAM footprint
    pub fn smallest_model(&self) -> Option<&ModelConfig> {
        self.specs
            .iter()
            .min_by(|a, b| a.vram_gb.total_cmp(&b.vram_gb).then_with(|| a.name.cmp(&b.name)))
    }

    /// Pick a model and backend against the current GPU state
    pub async fn decide_model_and_backend(
        &self,
        agent_type: AgentType,
        preferred_model: Option<&str>,
        min_context_tokens: usize,
        prefer_efficient_backend: bool,
    ) -> Result<LoadBalancingDecision> {
        let state = self.monitor.current_or_latest().await;
        let decision = self
            .decide_for_state(
                &state,
                agent_type,
                preferred_model,
                min_context_tokens,
                prefer_efficient_backend,
            )
            .await;

        match &decision {
            Ok(decision) => {
                METRICS.routing.decisions.inc();
                if decision.reason.starts_with("FALLBACK") {
                    METRICS.routing.fallback_decisions.inc();
                }
                debug!(
                    agent = %agent_type,
                    model = %decision.model_name,
                    backend = %decision.backend,
                    reason = %decision.reason,
                    "Routing decision"
                );
            }
            Err(e) => {
                METRICS.routing.resource_exhausted.inc();
                warn!(agent = %agent_type, error = %e, "No model fits current GPU state");
            }
        }

        decision
    }

    /// Decision logic for an explicit GPU state
    pub async fn decide_for_state(
        &self,
        state: &GpuMemoryState,
        agent_type: AgentType,
        preferred_model: Option<&str>,
        min_context_tokens: usize,
        prefer_efficient_backend: bool,
    ) -> Result<LoadBalancingDecision> {
        let utilization = state.utilization_percent();
        let pressure = self.pressure_tier(utilization);
        let models = self.models.read().await;

        if pressure == PressureTier::Critical || state.temperature_c > self.config.temperature_limit_c {
            let smallest = self
                .smallest_model()
                .ok_or_else(|| TriageError::resource_exhausted("no models registered"))?;
            let backend = if smallest.supports(BackendKind::LlamaCpp) {
                BackendKind::LlamaCpp
            } else {
                smallest.backend
            };
            let reason = format!(
                "FALLBACK: {} pressure ({:.1}% used, {:.0}C)",
                pressure, utilization, state.temperature_c
            );
            return Ok(self.build_decision(smallest, backend, reason, state, pressure, &models));
        }

        let prefer_efficient = prefer_efficient_backend || pressure == PressureTier::High;
        let fits = |model: &ModelConfig| {
            state.available_gb - self.config.safety_margin_gb >= model.vram_gb
                && model.context_tokens >= min_context_tokens
        };

        let preferred = preferred_model
            .or_else(|| self.agents.get(&agent_type).map(String::as_str))
            .and_then(|name| self.specs.iter().find(|model| model.name == name));

        if let Some(model) = preferred.filter(|&model| fits(model)) {
            let backend = self.choose_backend(model, state, prefer_efficient);
            let reason = format!(
                "PREFERRED: {} fits in {:.1}GB available ({} pressure)",
                model.name, state.available_gb, pressure
            );
            return Ok(self.build_decision(model, backend, reason, state, pressure, &models));
        }

        let best = self
            .specs
            .iter()
            .filter(|&model| fits(model))
            .min_by(|&a, &b| {
                let score = |model: &ModelConfig| {
                    models
                        .get(&model.name)
                        .map(ModelLoadInfo::priority_score)
                        .unwrap_or(0.0)
                };
                score(a)
                    .total_cmp(&score(b))
                    .then_with(|| a.vram_gb.total_cmp(&b.vram_gb))
                    .then_with(|| a.name.cmp(&b.name))
            });

        match best {
            Some(model) => {
                let backend = self.choose_backend(model, state, prefer_efficient);
                let reason = format!(
                    "BEST_FIT: {} has the lowest load score of models fitting {:.1}GB ({} pressure)",
                    model.name, state.available_gb, pressure
                );
                Ok(self.build_decision(model, backend, reason, state, pressure, &models))
            }
            None => Err(TriageError::resource_exhausted(format!(
                "no model with {} context tokens fits {:.1}GB available (margin {:.1}GB)",
                min_context_tokens, state.available_gb, self.config.safety_margin_gb
            ))),
        }
    }

    fn choose_backend(
        &self,
        model: &ModelConfig,
        state: &GpuMemoryState,
        prefer_efficient: bool,
    ) -> BackendKind {
        if prefer_efficient && model.supports(BackendKind::LlamaCpp) {
            BackendKind::LlamaCpp
        } else if model.supports(BackendKind::Vllm)
            && state.available_gb > self.config.throughput_min_available_gb
        {
            BackendKind::Vllm
        } else {
            model.backend
        }
    }

    fn build_decision(
        &self,
        model: &ModelConfig,
        backend: BackendKind,
        reason: String,
        state: &GpuMemoryState,
        pressure: PressureTier,
        models: &HashMap<String, ModelLoadInfo>,
    ) -> LoadBalancingDecision {
        let estimated_duration_ms = match models.get(&model.name) {
            Some(load) if load.latency_samples > 0 => load.avg_latency_ms,
            _ => {
                let tps = SizeClass::from_vram(model.vram_gb).tokens_per_second(backend);
                self.config.response_tokens as f64 / tps * 1000.0
            }
        };

        LoadBalancingDecision {
            model_name: model.name.clone(),
            backend,
            port: model.port,
            reason,
            estimated_duration_ms,
            will_exceed_memory: state.available_gb - self.config.safety_margin_gb < model.vram_gb,
            pressure,
        }
    }

    /// Fold an observed latency into the model's moving average
    pub async fn update_model_metrics(&self, model_name: &str, latency_ms: f64, queue_size: usize) {
        let mut models = self.models.write().await;
        if let Some(load) = models.get_mut(model_name) {
            load.avg_latency_ms = if load.latency_samples == 0 {
                latency_ms
            } else {
                self.config.ema_weight * latency_ms + (1.0 - self.config.ema_weight) * load.avg_latency_ms
            };
            load.latency_samples += 1;
            load.queue_size = queue_size;
            load.last_used = Some(Utc::now());
        }
    }

    pub async fn report_model_failure(&self, model_name: &str) {
        let mut models = self.models.write().await;
        if let Some(load) = models.get_mut(model_name) {
            load.failure_count += 1;
            info!(
                model = model_name,
                failures = load.failure_count,
                "Model failure recorded"
            );
        }
    }

    pub async fn set_queue_size(&self, model_name: &str, queue_size: usize) {
        let mut models = self.models.write().await;
        if let Some(load) = models.get_mut(model_name) {
            load.queue_size = queue_size;
        }
    }

    pub async fn model_load(&self, model_name: &str) -> Option<ModelLoadInfo> {
        self.models.read().await.get(model_name).cloned()
    }

    /// All model load entries, sorted by name
    pub async fn snapshot(&self) -> Vec<ModelLoadInfo> {
        let mut loads: Vec<_> = self.models.read().await.values().cloned().collect();
        loads.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        loads
    }
}
