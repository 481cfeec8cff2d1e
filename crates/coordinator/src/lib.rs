//! Triage Coordinator
//!
//! GPU-aware routing, backend calls, workflow orchestration and the queue
//! consumers of the Triage control plane.

pub mod backend;
pub mod balancer;
pub mod dispatcher;
pub mod monitor;
pub mod personas;
pub mod router;
pub mod service;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendEndpoint, ChatBackend, ChatCompletionRequest, HttpBackend};
pub use balancer::{DecisionEngine, LoadBalancingDecision, ModelLoadInfo, PressureTier};
pub use dispatcher::Dispatcher;
pub use monitor::{GpuMemoryState, NvidiaSmi, ResourceMonitor, StaticTelemetry, TelemetrySource};
pub use router::{GenerateOutcome, GenerationConstraints, ModelRouter};
pub use service::{ControlPlane, InferenceRequest};
pub use workflow::{AgentResult, AgentTask, WorkflowContext, WorkflowOrchestrator, WorkflowResult, WorkflowType};
