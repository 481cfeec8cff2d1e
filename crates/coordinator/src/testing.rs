//! Test doubles shared by the coordinator's unit tests

use crate::backend::{BackendEndpoint, ChatBackend, ChatCompletionRequest};
use crate::balancer::DecisionEngine;
use crate::monitor::{GpuMemoryState, ResourceMonitor, StaticTelemetry};
use crate::router::ModelRouter;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use triage_common::{Result, TriageConfig};

type Responder = Box<dyn Fn(&ChatCompletionRequest) -> Result<String> + Send + Sync>;

/// In-memory backend that answers from a script, then from a responder
pub(crate) struct ScriptedBackend {
    script: Mutex<VecDeque<Result<String>>>,
    responder: Responder,
    delay: Option<Duration>,
    calls: Mutex<Vec<(BackendEndpoint, ChatCompletionRequest)>>,
}

impl ScriptedBackend {
    pub(crate) fn new(
        responder: impl Fn(&ChatCompletionRequest) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            responder: Box::new(responder),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with `response to: <last user message>`
    pub(crate) fn echo() -> Self {
        Self::new(|request| {
            let prompt = request
                .messages
                .iter()
                .rev()
                .find(|message| message.role == "user")
                .map(|message| message.content.clone())
                .unwrap_or_default();
            Ok(format!("response to: {}", prompt))
        })
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a one-off result ahead of the responder
    pub(crate) fn push(&self, result: Result<String>) {
        self.script.lock().push_back(result);
    }

    pub(crate) fn calls(&self) -> Vec<(BackendEndpoint, ChatCompletionRequest)> {
        self.calls.lock().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn chat_completion(
        &self,
        endpoint: &BackendEndpoint,
        request: &ChatCompletionRequest,
    ) -> Result<String> {
        self.calls.lock().push((endpoint.clone(), request.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => (self.responder)(request),
        }
    }
}

/// Configuration with millisecond backoffs
pub(crate) fn fast_config() -> TriageConfig {
    let mut config = TriageConfig::default();
    config.backend.timeout_backoff_ms = 1;
    config.backend.error_backoff_ms = 1;
    config
}

/// A roomy, cool GPU
pub(crate) fn idle_gpu() -> GpuMemoryState {
    GpuMemoryState::new(24.0, 4.0, 50.0, 100.0)
}

pub(crate) fn monitor(state: GpuMemoryState) -> Arc<ResourceMonitor> {
    Arc::new(ResourceMonitor::new(
        Arc::new(StaticTelemetry::new(state)),
        Duration::from_secs(60),
        10,
        24.0,
    ))
}

pub(crate) fn router_with(
    config: &TriageConfig,
    backend: Arc<ScriptedBackend>,
) -> (Arc<ModelRouter>, Arc<DecisionEngine>) {
    let engine = Arc::new(DecisionEngine::new(monitor(idle_gpu()), config));
    let router = Arc::new(ModelRouter::new(engine.clone(), backend, config));
    (router, engine)
}
