//! Model routing
//!
//! Resolves an agent type to its model, asks the decision engine where to
//! run it, and performs the backend call with retry and backoff. Exhausted
//! retries degrade to a labeled stub instead of an error.

use crate::backend::{BackendEndpoint, ChatBackend, ChatCompletionRequest};
use crate::balancer::{DecisionEngine, LoadBalancingDecision};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use triage_common::config::{BackendConfig, ModelConfig};
use triage_common::{AgentType, BackendKind, ChatMessage, Result, TriageConfig, TriageError, METRICS};

/// Prefix of every degraded response
pub const DEGRADED_MARKER: &str = "[DEGRADED RESPONSE]";

/// Per-call routing hints
#[derive(Debug, Clone, Default)]
pub struct GenerationConstraints {
    /// Overrides the agent's registered model
    pub preferred_model: Option<String>,
    pub min_context_tokens: usize,
    pub prefer_efficient_backend: bool,
}

/// Result of a generation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GenerateOutcome {
    Success {
        content: String,
        model: String,
        backend: BackendKind,
        latency_ms: f64,
        attempts: u32,
    },
    Degraded {
        content: String,
        model: String,
        reason: String,
    },
}

impl GenerateOutcome {
    pub fn content(&self) -> &str {
        match self {
            GenerateOutcome::Success { content, .. } | GenerateOutcome::Degraded { content, .. } => {
                content
            }
        }
    }

    pub fn model(&self) -> &str {
        match self {
            GenerateOutcome::Success { model, .. } | GenerateOutcome::Degraded { model, .. } => model,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, GenerateOutcome::Degraded { .. })
    }
}

/// Routes generations to model serving instances
pub struct ModelRouter {
    engine: Arc<DecisionEngine>,
    backend: Arc<dyn ChatBackend>,
    config: BackendConfig,
    models: HashMap<String, ModelConfig>,
    agents: HashMap<AgentType, String>,
    in_flight: Mutex<HashMap<String, usize>>,
}

/// Decrements a model's in-flight count when dropped
struct InFlight<'a> {
    router: &'a ModelRouter,
    model: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.router.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&self.model) {
            *count = count.saturating_sub(1);
        }
    }
}

impl ModelRouter {
    pub fn new(engine: Arc<DecisionEngine>, backend: Arc<dyn ChatBackend>, config: &TriageConfig) -> Self {
        Self {
            engine,
            backend,
            config: config.backend.clone(),
            models: config
                .models
                .iter()
                .map(|model| (model.name.clone(), model.clone()))
                .collect(),
            agents: config.agents.clone(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Registered model for an agent type
    pub fn agent_model(&self, agent_type: AgentType) -> Result<&ModelConfig> {
        self.agents
            .get(&agent_type)
            .and_then(|name| self.models.get(name))
            .ok_or_else(|| {
                TriageError::UnknownAgentType(format!("no model registered for agent {}", agent_type))
            })
    }

    /// Serving address and credential for a decision
    pub fn endpoint_for(&self, decision: &LoadBalancingDecision) -> Result<BackendEndpoint> {
        let model = self.models.get(&decision.model_name).ok_or_else(|| {
            TriageError::config(format!("decision names unknown model {}", decision.model_name))
        })?;
        let host = model.host.as_deref().unwrap_or(&self.config.host);

        Ok(BackendEndpoint::new(
            format!("{}:{}", host.trim_end_matches('/'), decision.port),
            model.api_key.clone(),
        ))
    }

    fn begin(&self, model: &str) -> (InFlight<'_>, usize) {
        let mut in_flight = self.in_flight.lock();
        let count = in_flight.entry(model.to_string()).or_insert(0);
        *count += 1;
        let current = *count;
        drop(in_flight);

        (
            InFlight {
                router: self,
                model: model.to_string(),
            },
            current,
        )
    }

    fn in_flight(&self, model: &str) -> usize {
        self.in_flight.lock().get(model).copied().unwrap_or(0)
    }

    /// Generate a completion for `agent_type`
    ///
    /// Unknown agents and resource exhaustion fail synchronously; backend
    /// failures are retried and finally answered with a degraded stub.
    pub async fn generate(
        &self,
        agent_type: AgentType,
        messages: Vec<ChatMessage>,
        constraints: &GenerationConstraints,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<GenerateOutcome> {
        let registered = self.agent_model(agent_type)?;
        let preferred = constraints
            .preferred_model
            .as_deref()
            .unwrap_or(&registered.name);

        let decision = self
            .engine
            .decide_model_and_backend(
                agent_type,
                Some(preferred),
                constraints.min_context_tokens,
                constraints.prefer_efficient_backend,
            )
            .await?;
        let endpoint = self.endpoint_for(&decision)?;

        let request = ChatCompletionRequest {
            messages,
            temperature,
            max_tokens,
            stream: false,
            top_p: self.config.top_p,
            frequency_penalty: self.config.frequency_penalty,
            presence_penalty: self.config.presence_penalty,
        };

        let (_guard, queue_size) = self.begin(&decision.model_name);
        self.engine.set_queue_size(&decision.model_name, queue_size).await;

        let max_attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            match self.backend.chat_completion(&endpoint, &request).await {
                Ok(content) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    METRICS.routing.backend_latency.observe(latency_ms / 1000.0);
                    self.engine
                        .update_model_metrics(
                            &decision.model_name,
                            latency_ms,
                            self.in_flight(&decision.model_name).saturating_sub(1),
                        )
                        .await;

                    debug!(
                        model = %decision.model_name,
                        backend = %decision.backend,
                        attempt,
                        latency_ms,
                        "Generation succeeded"
                    );

                    return Ok(GenerateOutcome::Success {
                        content,
                        model: decision.model_name,
                        backend: decision.backend,
                        latency_ms,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!(
                        model = %decision.model_name,
                        url = %endpoint.completions_url(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "Backend call failed"
                    );

                    let retryable = e.is_retryable();
                    let backoff = match &e {
                        TriageError::BackendTimeout(_) => {
                            Duration::from_millis(self.config.timeout_backoff_ms * attempt as u64)
                        }
                        _ => Duration::from_millis(self.config.error_backoff_ms),
                    };
                    last_error = Some(e);

                    if !retryable {
                        break;
                    }
                    if attempt < max_attempts {
                        METRICS.routing.backend_retries.inc();
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        self.engine.report_model_failure(&decision.model_name).await;
        METRICS.routing.degraded_responses.inc();

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        info!(
            agent = %agent_type,
            model = %decision.model_name,
            reason = %reason,
            "Answering with degraded response"
        );

        Ok(GenerateOutcome::Degraded {
            content: format!(
                "{} The {} service ({}) is temporarily unavailable. \
                 This output was not generated by a model; retry the request or route it for manual review.",
                DEGRADED_MARKER, agent_type, decision.model_name
            ),
            model: decision.model_name,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, router_with, ScriptedBackend};

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::user("List the discharge medications.")]
    }

    #[tokio::test]
    async fn test_generate_success() {
        let backend = Arc::new(ScriptedBackend::echo());
        let (router, engine) = router_with(&fast_config(), backend.clone());

        let outcome = router
            .generate(AgentType::Pharmacy, messages(), &GenerationConstraints::default(), 256, 0.2)
            .await
            .unwrap();

        assert!(!outcome.is_degraded());
        assert_eq!(outcome.model(), "pharma-7b");
        assert_eq!(outcome.content(), "response to: List the discharge medications.");

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        let (endpoint, request) = &calls[0];
        assert_eq!(endpoint.completions_url(), "http://127.0.0.1:8003/v1/chat/completions");
        assert_eq!(request.max_tokens, 256);
        assert_eq!(request.temperature, 0.2);
        assert!(!request.stream);
        assert_eq!(request.top_p, 0.95);

        let load = engine.model_load("pharma-7b").await.unwrap();
        assert_eq!(load.latency_samples, 1);
        assert_eq!(load.failure_count, 0);
        assert_eq!(load.queue_size, 0);
    }

    #[tokio::test]
    async fn test_model_credentials_and_host_override() {
        let mut config = fast_config();
        for model in config.models.iter_mut().filter(|model| model.name == "billing-3b") {
            model.api_key = Some("billing-key".to_string());
            model.host = Some("http://10.0.0.7".to_string());
        }
        let backend = Arc::new(ScriptedBackend::echo());
        let (router, _) = router_with(&config, backend.clone());

        router
            .generate(AgentType::Claims, messages(), &GenerationConstraints::default(), 64, 0.7)
            .await
            .unwrap();

        let (endpoint, _) = &backend.calls()[0];
        assert_eq!(endpoint.base_url, "http://10.0.0.7:8002");
        assert_eq!(endpoint.api_key.as_deref(), Some("billing-key"));
    }

    #[tokio::test]
    async fn test_unmapped_agent_is_config_error() {
        let mut config = fast_config();
        config.agents.remove(&AgentType::Radiology);
        let backend = Arc::new(ScriptedBackend::echo());
        let (router, _) = router_with(&config, backend.clone());

        let result = router
            .generate(AgentType::Radiology, messages(), &GenerationConstraints::default(), 64, 0.7)
            .await;

        assert!(matches!(result, Err(TriageError::UnknownAgentType(_))));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let backend = Arc::new(ScriptedBackend::echo());
        backend.push(Err(TriageError::backend_timeout("slow")));
        backend.push(Err(TriageError::backend_unavailable("refused")));
        let (router, engine) = router_with(&fast_config(), backend.clone());

        let outcome = router
            .generate(AgentType::General, messages(), &GenerationConstraints::default(), 64, 0.7)
            .await
            .unwrap();

        match outcome {
            GenerateOutcome::Success { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(backend.call_count(), 3);
        assert_eq!(engine.model_load("general-1b").await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_degrade() {
        let backend = Arc::new(ScriptedBackend::new(|_| {
            Err(TriageError::backend_unavailable("connection refused"))
        }));
        let (router, engine) = router_with(&fast_config(), backend.clone());

        let outcome = router
            .generate(AgentType::Billing, messages(), &GenerationConstraints::default(), 64, 0.7)
            .await
            .unwrap();

        assert!(outcome.is_degraded());
        assert!(outcome.content().starts_with(DEGRADED_MARKER));
        assert_eq!(backend.call_count(), 3);
        assert_eq!(engine.model_load("billing-3b").await.unwrap().failure_count, 1);
        match outcome {
            GenerateOutcome::Degraded { reason, .. } => assert!(reason.contains("connection refused")),
            other => panic!("expected degraded, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_backoff_grows_linearly() {
        let backend = Arc::new(ScriptedBackend::new(|_| Err(TriageError::backend_timeout("read timeout"))));
        let (router, _) = router_with(&TriageConfig::default(), backend.clone());

        let started = tokio::time::Instant::now();
        let outcome = router
            .generate(AgentType::General, messages(), &GenerationConstraints::default(), 64, 0.7)
            .await
            .unwrap();

        // 1s after the first attempt, 2s after the second, none after the last
        assert!(outcome.is_degraded());
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_backoff_is_flat() {
        let backend = Arc::new(ScriptedBackend::new(|_| Err(TriageError::backend_unavailable("502"))));
        let (router, _) = router_with(&TriageConfig::default(), backend.clone());

        let started = tokio::time::Instant::now();
        router
            .generate(AgentType::General, messages(), &GenerationConstraints::default(), 64, 0.7)
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_preferred_model_constraint() {
        let backend = Arc::new(ScriptedBackend::echo());
        let (router, _) = router_with(&fast_config(), backend.clone());

        let constraints = GenerationConstraints {
            preferred_model: Some("translate-4b".to_string()),
            ..Default::default()
        };
        let outcome = router
            .generate(AgentType::General, messages(), &constraints, 64, 0.7)
            .await
            .unwrap();

        assert_eq!(outcome.model(), "translate-4b");
    }

    #[tokio::test]
    async fn test_in_flight_counts_feed_queue_size() {
        let backend = Arc::new(ScriptedBackend::echo().with_delay(Duration::from_millis(50)));
        let (router, engine) = router_with(&fast_config(), backend.clone());

        let calls = (0..3).map(|_| {
            let router = router.clone();
            async move {
                router
                    .generate(AgentType::General, messages(), &GenerationConstraints::default(), 64, 0.7)
                    .await
            }
        });
        let (outcomes, observed) = tokio::join!(futures::future::join_all(calls), async {
            tokio::time::sleep(Duration::from_millis(25)).await;
            engine.model_load("general-1b").await.unwrap().queue_size
        });

        assert!(outcomes.iter().all(|outcome| outcome.is_ok()));
        assert_eq!(observed, 3);
        assert_eq!(router.in_flight("general-1b"), 0);
    }
}
