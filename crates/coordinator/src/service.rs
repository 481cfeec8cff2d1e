//! Control plane wiring
//!
//! Builds the queue, monitor, decision engine, router, orchestrator and
//! dispatcher once at startup and exposes the submission, status and
//! workflow surfaces consumed by the route layer.

use crate::backend::{ChatBackend, HttpBackend};
use crate::balancer::{DecisionEngine, ModelLoadInfo};
use crate::dispatcher::Dispatcher;
use crate::monitor::{GpuMemoryState, ResourceMonitor};
use crate::router::ModelRouter;
use crate::workflow::{AgentTask, WorkflowContext, WorkflowOrchestrator, WorkflowResult, WorkflowType};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use triage_common::{AgentType, ChatMessage, Priority, Result, TriageConfig, TriageError, METRICS};
use triage_queue::{BatchResults, InferenceTask, QueueStats, Submission, TaskQueue};

const MAX_TEMPERATURE: f32 = 2.0;

/// Submission as received from the route layer, before validation
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceRequest {
    pub agent_type: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub model_preference: Option<String>,
}

impl InferenceRequest {
    pub fn new(agent_type: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            agent_type: agent_type.into(),
            messages,
            priority: None,
            timeout_seconds: None,
            max_tokens: None,
            temperature: None,
            model_preference: None,
        }
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }
}

/// The assembled control plane
pub struct ControlPlane {
    config: TriageConfig,
    queue: Arc<TaskQueue>,
    monitor: Arc<ResourceMonitor>,
    engine: Arc<DecisionEngine>,
    orchestrator: WorkflowOrchestrator,
    dispatcher: Arc<Dispatcher>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlPlane {
    /// Build every service from configuration with the HTTP backend
    pub fn build(config: TriageConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(HttpBackend::new(config.request_timeout())?);
        let monitor = Arc::new(ResourceMonitor::from_config(&config.monitor));
        Ok(Self::with_parts(config, monitor, backend))
    }

    /// Build around an existing monitor and backend
    pub fn with_parts(
        config: TriageConfig,
        monitor: Arc<ResourceMonitor>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        let queue = Arc::new(TaskQueue::new(config.queue.clone()));
        let engine = Arc::new(DecisionEngine::new(monitor.clone(), &config));
        let router = Arc::new(ModelRouter::new(engine.clone(), backend, &config));
        let orchestrator = WorkflowOrchestrator::new(router.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            router,
            config.dispatcher.clone(),
            &config.queue,
        ));

        Self {
            config,
            queue,
            monitor,
            engine,
            orchestrator,
            dispatcher,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start GPU sampling and the dispatcher loops
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }

        handles.push(self.monitor.clone().start_monitoring());
        handles.extend(self.dispatcher.clone().start());
        info!(
            models = self.config.models.len(),
            background_tasks = handles.len(),
            "Control plane started"
        );
    }

    /// Stop background loops; in-flight backend calls are abandoned
    pub fn shutdown(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        info!(stopped = handles.len(), "Control plane stopped");
    }

    /// Validate a raw request into a task
    pub fn validate_request(&self, request: InferenceRequest) -> Result<InferenceTask> {
        let agent_type: AgentType = request.agent_type.parse()?;
        if !self.config.agents.contains_key(&agent_type) {
            return Err(TriageError::UnknownAgentType(format!(
                "no model registered for agent {}",
                agent_type
            )));
        }
        let priority = match request.priority.as_deref() {
            Some(raw) => raw.parse::<Priority>()?,
            None => Priority::default(),
        };

        if request.messages.is_empty() {
            return Err(TriageError::invalid_input("request has no messages"));
        }
        if let Some(model) = &request.model_preference {
            if self.config.model(model).is_none() {
                return Err(TriageError::invalid_input(format!("unknown model: {}", model)));
            }
        }

        let mut task = self.queue.new_task(agent_type, request.messages).with_priority(priority);
        if let Some(timeout) = request.timeout_seconds {
            if timeout == 0 {
                return Err(TriageError::invalid_input("timeout_seconds must be positive"));
            }
            task = task.with_timeout(timeout);
        }
        if request.max_tokens.is_some() || request.temperature.is_some() {
            let max_tokens = request.max_tokens.unwrap_or(task.max_tokens);
            let temperature = request.temperature.unwrap_or(task.temperature);
            if max_tokens == 0 {
                return Err(TriageError::invalid_input("max_tokens must be positive"));
            }
            if !(0.0..=MAX_TEMPERATURE).contains(&temperature) {
                return Err(TriageError::invalid_input(format!(
                    "temperature {} outside 0..={}",
                    temperature, MAX_TEMPERATURE
                )));
            }
            task = task.with_generation(max_tokens, temperature);
        }
        if let Some(model) = request.model_preference {
            task = task.with_model_preference(model);
        }

        Ok(task)
    }

    /// Validate and submit a request; cache hits return immediately
    pub fn submit(&self, request: InferenceRequest) -> Result<Submission> {
        let task = self.validate_request(request)?;
        self.queue.submit(task)
    }

    pub fn get_task(&self, id: &str) -> Result<InferenceTask> {
        self.queue.get_task(id)
    }

    pub fn get_stats(&self) -> QueueStats {
        self.queue.get_stats()
    }

    pub fn get_batch_results(&self, batch_id: &str) -> Result<BatchResults> {
        self.queue.get_batch_results(batch_id)
    }

    pub fn cancel_task(&self, id: &str) -> Result<()> {
        self.queue.cancel_task(id)
    }

    pub async fn execute_workflow(
        &self,
        workflow_type: WorkflowType,
        context: &WorkflowContext,
        custom_tasks: Option<Vec<AgentTask>>,
    ) -> Result<WorkflowResult> {
        self.orchestrator
            .execute_workflow(workflow_type, context, custom_tasks)
            .await
    }

    /// Most recent GPU sample, if any
    pub fn gpu_state(&self) -> Option<GpuMemoryState> {
        self.monitor.latest()
    }

    pub async fn model_loads(&self) -> Vec<ModelLoadInfo> {
        self.engine.snapshot().await
    }

    /// Prometheus text exposition of every registered metric
    pub fn metrics_text(&self) -> Result<String> {
        METRICS
            .gather()
            .map_err(|e| TriageError::internal(format!("failed to encode metrics: {}", e)))
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        for handle in self.handles.get_mut().drain(..) {
            handle.abort();
        }
    }
}
