//! Multi-agent workflow orchestration
//!
//! A workflow is a dependency graph of agent tasks. Tasks whose dependencies
//! have all finished run together as a wave; each wave is awaited before the
//! next one starts. A failing task does not cancel its wave-mates.

pub mod templates;

use crate::personas;
use crate::router::{GenerateOutcome, GenerationConstraints, ModelRouter};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use triage_common::{AgentType, ChatMessage, Result, TriageError, METRICS};
use uuid::Uuid;

pub use templates::WorkflowTemplate;

/// Request context handed to templates
pub type WorkflowContext = HashMap<String, String>;

const DEFAULT_TASK_MAX_TOKENS: u32 = 512;
const DEFAULT_TASK_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    DischargeSummary,
    ClaimsJustification,
    MedicationReview,
    PriorAuthorization,
    Custom,
}

impl WorkflowType {
    pub const ALL: [WorkflowType; 5] = [
        WorkflowType::DischargeSummary,
        WorkflowType::ClaimsJustification,
        WorkflowType::MedicationReview,
        WorkflowType::PriorAuthorization,
        WorkflowType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::DischargeSummary => "discharge_summary",
            WorkflowType::ClaimsJustification => "claims_justification",
            WorkflowType::MedicationReview => "medication_review",
            WorkflowType::PriorAuthorization => "prior_authorization",
            WorkflowType::Custom => "custom",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        WorkflowType::ALL
            .into_iter()
            .find(|workflow_type| workflow_type.as_str() == normalized)
            .ok_or_else(|| TriageError::invalid_input(format!("unknown workflow type: {}", s)))
    }
}

/// One node of a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub name: String,
    pub agent_type: AgentType,
    pub prompt: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_task_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_task_temperature")]
    pub temperature: f32,
}

fn default_task_max_tokens() -> u32 {
    DEFAULT_TASK_MAX_TOKENS
}

fn default_task_temperature() -> f32 {
    DEFAULT_TASK_TEMPERATURE
}

impl AgentTask {
    pub fn new(name: impl Into<String>, agent_type: AgentType, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type,
            prompt: prompt.into(),
            dependencies: Vec::new(),
            max_tokens: DEFAULT_TASK_MAX_TOKENS,
            temperature: DEFAULT_TASK_TEMPERATURE,
        }
    }

    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|dep| dep.to_string()).collect();
        self
    }

    pub fn with_generation(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

/// Outcome of one agent task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResult {
    pub name: String,
    pub agent_type: AgentType,
    pub success: bool,
    pub content: String,
    pub latency_ms: f64,
    pub error: Option<String>,
    pub model: Option<String>,
    pub degraded: bool,
}

/// Aggregate outcome of a workflow
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
    /// True when every task succeeded
    pub success: bool,
    pub aggregated_content: String,
    pub total_latency_ms: f64,
    pub parallel_efficiency: f64,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Per-task results in task order
    pub results: Vec<AgentResult>,
}

/// Group task indices into waves, dependencies first
///
/// Fails if any task can never become ready (cycle or unknown dependency).
pub fn plan_waves(tasks: &[AgentTask]) -> Result<Vec<Vec<usize>>> {
    let mut completed: HashSet<&str> = HashSet::new();
    let mut waves = Vec::new();

    while completed.len() < tasks.len() {
        let ready: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| !completed.contains(task.name.as_str()))
            .filter(|(_, task)| task.dependencies.iter().all(|dep| completed.contains(dep.as_str())))
            .map(|(index, _)| index)
            .collect();

        if ready.is_empty() {
            let blocked: Vec<String> = tasks
                .iter()
                .filter(|task| !completed.contains(task.name.as_str()))
                .map(|task| format!("{} <- [{}]", task.name, task.dependencies.join(", ")))
                .collect();
            return Err(TriageError::unsatisfiable(format!(
                "tasks can never run (cycle or missing dependency): {}",
                blocked.join("; ")
            )));
        }

        completed.extend(ready.iter().map(|&index| tasks[index].name.as_str()));
        waves.push(ready);
    }

    Ok(waves)
}

fn validate_tasks(tasks: &[AgentTask]) -> Result<()> {
    if tasks.is_empty() {
        return Err(TriageError::invalid_input("workflow has no tasks"));
    }

    let mut names = HashSet::new();
    for task in tasks {
        if task.name.trim().is_empty() {
            return Err(TriageError::invalid_input("workflow task with empty name"));
        }
        if !names.insert(task.name.as_str()) {
            return Err(TriageError::invalid_input(format!(
                "duplicate workflow task name: {}",
                task.name
            )));
        }
    }

    Ok(())
}

/// Prompt with completed dependency output prepended
pub fn compose_prompt(task: &AgentTask, completed: &HashMap<String, AgentResult>) -> String {
    let mut prompt = String::new();
    for dep in &task.dependencies {
        if let Some(result) = completed.get(dep).filter(|result| result.success) {
            prompt.push_str(&format!("[{} Result]:\n{}\n\n", dep, result.content));
        }
    }
    prompt.push_str(&task.prompt);
    prompt
}

fn aggregate_template(template: &WorkflowTemplate, results: &[AgentResult]) -> String {
    let by_name: HashMap<&str, &AgentResult> =
        results.iter().map(|result| (result.name.as_str(), result)).collect();

    let mut output = format!("# {}\n", template.title);
    for (task, header) in &template.sections {
        output.push_str(&format!("\n## {}\n", header));
        match by_name.get(task) {
            Some(result) if result.success => output.push_str(&result.content),
            Some(result) => output.push_str(&format!(
                "_Unavailable: {}_",
                result.error.as_deref().unwrap_or("task failed")
            )),
            None => output.push_str("_Unavailable: task did not run_"),
        }
        output.push('\n');
    }
    output
}

fn aggregate_generic(results: &[AgentResult]) -> String {
    results
        .iter()
        .filter(|result| result.success)
        .map(|result| format!("## {}\n{}\n", result.agent_type, result.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs workflow graphs on top of the model router
pub struct WorkflowOrchestrator {
    router: Arc<ModelRouter>,
}

impl WorkflowOrchestrator {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self { router }
    }

    /// Execute a named or custom workflow
    pub async fn execute_workflow(
        &self,
        workflow_type: WorkflowType,
        context: &WorkflowContext,
        custom_tasks: Option<Vec<AgentTask>>,
    ) -> Result<WorkflowResult> {
        let result = self.run(workflow_type, context, custom_tasks).await;

        METRICS.workflow.workflows_executed.inc();
        match &result {
            Ok(result) if result.success => {}
            Ok(_) | Err(_) => METRICS.workflow.workflows_failed.inc(),
        }
        if let Err(e) = &result {
            warn!(workflow = %workflow_type, error = %e, "Workflow rejected");
        }

        result
    }

    async fn run(
        &self,
        workflow_type: WorkflowType,
        context: &WorkflowContext,
        custom_tasks: Option<Vec<AgentTask>>,
    ) -> Result<WorkflowResult> {
        let template = templates::template(workflow_type, context);
        let tasks = match (&template, custom_tasks) {
            (Some(template), None) => template.tasks.clone(),
            (None, Some(tasks)) => tasks,
            (None, None) => {
                return Err(TriageError::invalid_input("custom workflows require tasks"));
            }
            (Some(_), Some(_)) => {
                return Err(TriageError::invalid_input(format!(
                    "{} is a named workflow and does not accept custom tasks",
                    workflow_type
                )));
            }
        };

        validate_tasks(&tasks)?;
        let waves = plan_waves(&tasks)?;

        let workflow_id = Uuid::new_v4().to_string();
        info!(
            workflow_id = %workflow_id,
            workflow = %workflow_type,
            tasks = tasks.len(),
            waves = waves.len(),
            "Executing workflow"
        );

        let started = Instant::now();
        let mut completed: HashMap<String, AgentResult> = HashMap::new();

        for (wave_index, wave) in waves.iter().enumerate() {
            debug!(
                workflow_id = %workflow_id,
                wave = wave_index,
                tasks = ?wave.iter().map(|&index| tasks[index].name.as_str()).collect::<Vec<_>>(),
                "Starting wave"
            );

            let outcomes = join_all(
                wave.iter()
                    .map(|&index| self.execute_single_task(&tasks[index], &completed)),
            )
            .await;

            for result in outcomes {
                completed.insert(result.name.clone(), result);
            }
        }

        let total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let results: Vec<AgentResult> = tasks
            .iter()
            .filter_map(|task| completed.remove(&task.name))
            .collect();

        let summed: f64 = results.iter().map(|result| result.latency_ms).sum();
        let parallel_efficiency = if total_latency_ms > 0.0 {
            (summed / total_latency_ms).min(1.0)
        } else {
            0.0
        };

        let aggregated_content = match &template {
            Some(template) => aggregate_template(template, &results),
            None => aggregate_generic(&results),
        };

        let failed: Vec<&str> = results
            .iter()
            .filter(|result| !result.success)
            .map(|result| result.name.as_str())
            .collect();
        let success = failed.is_empty();

        let mut metadata = BTreeMap::new();
        metadata.insert("task_count".to_string(), json!(tasks.len()));
        metadata.insert("wave_count".to_string(), json!(waves.len()));
        metadata.insert("failed_tasks".to_string(), json!(failed));
        metadata.insert(
            "waves".to_string(),
            json!(waves
                .iter()
                .map(|wave| wave.iter().map(|&index| tasks[index].name.clone()).collect::<Vec<_>>())
                .collect::<Vec<_>>()),
        );

        METRICS.workflow.workflow_duration.observe(total_latency_ms / 1000.0);
        METRICS.workflow.parallel_efficiency.observe(parallel_efficiency);

        info!(
            workflow_id = %workflow_id,
            success,
            total_latency_ms,
            parallel_efficiency,
            "Workflow finished"
        );

        Ok(WorkflowResult {
            workflow_id,
            workflow_type,
            success,
            aggregated_content,
            total_latency_ms,
            parallel_efficiency,
            metadata,
            results,
        })
    }

    /// Run one task with its dependency output and persona
    pub async fn execute_single_task(
        &self,
        task: &AgentTask,
        completed: &HashMap<String, AgentResult>,
    ) -> AgentResult {
        let messages = vec![
            personas::system_message(task.agent_type),
            ChatMessage::user(compose_prompt(task, completed)),
        ];

        let started = Instant::now();
        let outcome = self
            .router
            .generate(
                task.agent_type,
                messages,
                &GenerationConstraints::default(),
                task.max_tokens,
                task.temperature,
            )
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = match outcome {
            Ok(GenerateOutcome::Success { content, model, .. }) => AgentResult {
                name: task.name.clone(),
                agent_type: task.agent_type,
                success: true,
                content,
                latency_ms,
                error: None,
                model: Some(model),
                degraded: false,
            },
            Ok(GenerateOutcome::Degraded {
                content,
                model,
                reason,
            }) => AgentResult {
                name: task.name.clone(),
                agent_type: task.agent_type,
                success: false,
                content,
                latency_ms,
                error: Some(reason),
                model: Some(model),
                degraded: true,
            },
            Err(e) => AgentResult {
                name: task.name.clone(),
                agent_type: task.agent_type,
                success: false,
                content: String::new(),
                latency_ms,
                error: Some(e.to_string()),
                model: None,
                degraded: false,
            },
        };

        if !result.success {
            METRICS.workflow.agent_tasks_failed.inc();
            warn!(
                task = %task.name,
                agent = %task.agent_type,
                error = result.error.as_deref().unwrap_or_default(),
                "Workflow task failed"
            );
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, router_with, ScriptedBackend};
    use std::time::Duration;

    fn orchestrator(backend: Arc<ScriptedBackend>) -> WorkflowOrchestrator {
        let (router, _) = router_with(&fast_config(), backend);
        WorkflowOrchestrator::new(router)
    }

    fn user_prompt(request: &crate::backend::ChatCompletionRequest) -> &str {
        &request.messages[1].content
    }

    #[test]
    fn test_plan_waves_orders_dependencies() {
        let tasks = vec![
            AgentTask::new("justification", AgentType::Claims, "c").depends_on(&["billing", "drug"]),
            AgentTask::new("billing", AgentType::Billing, "b").depends_on(&["drug"]),
            AgentTask::new("drug", AgentType::Pharmacy, "a"),
            AgentTask::new("notes", AgentType::Clinical, "d"),
        ];

        assert_eq!(plan_waves(&tasks).unwrap(), vec![vec![2, 3], vec![1], vec![0]]);
    }

    #[test]
    fn test_plan_waves_rejects_cycles_and_missing_dependencies() {
        let cycle = vec![
            AgentTask::new("a", AgentType::General, "a").depends_on(&["b"]),
            AgentTask::new("b", AgentType::General, "b").depends_on(&["a"]),
            AgentTask::new("c", AgentType::General, "c"),
        ];
        assert!(matches!(
            plan_waves(&cycle),
            Err(TriageError::UnsatisfiableDependency(_))
        ));

        let dangling = vec![AgentTask::new("a", AgentType::General, "a").depends_on(&["ghost"])];
        assert!(matches!(
            plan_waves(&dangling),
            Err(TriageError::UnsatisfiableDependency(_))
        ));

        let self_loop = vec![AgentTask::new("a", AgentType::General, "a").depends_on(&["a"])];
        assert!(plan_waves(&self_loop).is_err());
    }

    #[test]
    fn test_compose_prompt_skips_failed_dependencies() {
        let task = AgentTask::new("billing", AgentType::Billing, "Code it.").depends_on(&["drug", "notes"]);
        let mut completed = HashMap::new();
        completed.insert(
            "drug".to_string(),
            AgentResult {
                name: "drug".to_string(),
                agent_type: AgentType::Pharmacy,
                success: true,
                content: "Metformin 500mg".to_string(),
                latency_ms: 1.0,
                error: None,
                model: None,
                degraded: false,
            },
        );
        completed.insert(
            "notes".to_string(),
            AgentResult {
                name: "notes".to_string(),
                agent_type: AgentType::Clinical,
                success: false,
                content: String::new(),
                latency_ms: 1.0,
                error: Some("boom".to_string()),
                model: None,
                degraded: false,
            },
        );

        assert_eq!(
            compose_prompt(&task, &completed),
            "[drug Result]:\nMetformin 500mg\n\nCode it."
        );
    }

    #[test]
    fn test_workflow_type_parsing() {
        assert_eq!(
            "discharge_summary".parse::<WorkflowType>().unwrap(),
            WorkflowType::DischargeSummary
        );
        assert_eq!(" Custom ".parse::<WorkflowType>().unwrap(), WorkflowType::Custom);
        assert!("triage_everything".parse::<WorkflowType>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discharge_summary_runs_in_one_wave() {
        let backend = Arc::new(ScriptedBackend::echo().with_delay(Duration::from_millis(100)));
        let orchestrator = orchestrator(backend.clone());

        let mut context = WorkflowContext::new();
        context.insert("clinical_notes".to_string(), "Admitted for CAP, treated with ceftriaxone.".to_string());

        let result = orchestrator
            .execute_workflow(WorkflowType::DischargeSummary, &context, None)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.metadata["wave_count"], json!(1));
        assert_eq!(backend.call_count(), 2);
        // Both tasks overlapped: one delay of wall clock, not two
        assert!(result.total_latency_ms < 150.0, "took {}ms", result.total_latency_ms);
        assert_eq!(result.parallel_efficiency, 1.0);

        let clinical = result.aggregated_content.find("## Clinical Summary").unwrap();
        let billing = result.aggregated_content.find("## Billing Codes").unwrap();
        assert!(result.aggregated_content.starts_with("# Discharge Summary"));
        assert!(clinical < billing);
        assert!(result.aggregated_content.contains("ceftriaxone"));

        let calls = backend.calls();
        assert!(calls.iter().all(|(_, request)| request.messages[0].role == "system"));
    }

    #[tokio::test]
    async fn test_dependency_output_is_prefixed() {
        let backend = Arc::new(ScriptedBackend::echo());
        let orchestrator = orchestrator(backend.clone());

        let mut context = WorkflowContext::new();
        context.insert("medication".to_string(), "semaglutide".to_string());

        let result = orchestrator
            .execute_workflow(WorkflowType::ClaimsJustification, &context, None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.metadata["wave_count"], json!(3));

        let drug = result.results.iter().find(|r| r.name == "drug_analysis").unwrap();
        let calls = backend.calls();
        let billing_prompt = calls
            .iter()
            .map(|(_, request)| user_prompt(request))
            .find(|prompt| prompt.contains("Produce the billing codes"))
            .unwrap();

        assert!(billing_prompt.starts_with(&format!("[drug_analysis Result]:\n{}\n\n", drug.content)));

        // The drug analysis ran before billing was even asked
        let drug_call = calls
            .iter()
            .position(|(_, request)| user_prompt(request).contains("Analyze the prescribed therapy"))
            .unwrap();
        let billing_call = calls
            .iter()
            .position(|(_, request)| user_prompt(request).contains("Produce the billing codes"))
            .unwrap();
        assert!(drug_call < billing_call);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_within_wave() {
        let backend = Arc::new(ScriptedBackend::new(|request| {
            let prompt = &request.messages[1].content;
            if prompt.contains("FAIL") {
                Err(TriageError::backend_unavailable("model crashed"))
            } else {
                Ok(format!("ok: {}", prompt))
            }
        }));
        let orchestrator = orchestrator(backend.clone());

        let tasks = vec![
            AgentTask::new("broken", AgentType::Clinical, "FAIL please"),
            AgentTask::new("healthy", AgentType::Billing, "Code the visit"),
            AgentTask::new("after", AgentType::General, "Summarize").depends_on(&["broken", "healthy"]),
        ];

        let result = orchestrator
            .execute_workflow(WorkflowType::Custom, &WorkflowContext::new(), Some(tasks))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.results.len(), 3);

        let broken = &result.results[0];
        assert!(!broken.success);
        assert!(broken.degraded);
        assert!(broken.error.as_deref().unwrap().contains("model crashed"));

        let healthy = &result.results[1];
        assert!(healthy.success);

        let after = &result.results[2];
        assert!(after.success);
        assert!(after.content.contains("[healthy Result]:"));
        assert!(!after.content.contains("[broken Result]:"));

        assert_eq!(result.metadata["failed_tasks"], json!(["broken"]));
        assert!(result.aggregated_content.contains("## billing"));
        assert!(!result.aggregated_content.contains("## clinical"));
    }

    #[tokio::test]
    async fn test_unsatisfiable_graph_is_rejected_before_any_call() {
        let backend = Arc::new(ScriptedBackend::echo());
        let orchestrator = orchestrator(backend.clone());

        let tasks = vec![
            AgentTask::new("a", AgentType::General, "a").depends_on(&["b"]),
            AgentTask::new("b", AgentType::General, "b").depends_on(&["a"]),
        ];
        let result = orchestrator
            .execute_workflow(WorkflowType::Custom, &WorkflowContext::new(), Some(tasks))
            .await;

        assert!(matches!(result, Err(TriageError::UnsatisfiableDependency(_))));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_custom_workflow_validation() {
        let orchestrator = orchestrator(Arc::new(ScriptedBackend::echo()));
        let context = WorkflowContext::new();

        assert!(matches!(
            orchestrator.execute_workflow(WorkflowType::Custom, &context, None).await,
            Err(TriageError::InvalidInput(_))
        ));
        assert!(matches!(
            orchestrator.execute_workflow(WorkflowType::Custom, &context, Some(vec![])).await,
            Err(TriageError::InvalidInput(_))
        ));

        let duplicated = vec![
            AgentTask::new("x", AgentType::General, "one"),
            AgentTask::new("x", AgentType::General, "two"),
        ];
        assert!(matches!(
            orchestrator
                .execute_workflow(WorkflowType::Custom, &context, Some(duplicated))
                .await,
            Err(TriageError::InvalidInput(_))
        ));

        let extra = vec![AgentTask::new("x", AgentType::General, "one")];
        assert!(orchestrator
            .execute_workflow(WorkflowType::DischargeSummary, &context, Some(extra))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_chain_efficiency() {
        let backend = Arc::new(ScriptedBackend::echo().with_delay(Duration::from_millis(100)));
        let orchestrator = orchestrator(backend);

        let result = orchestrator
            .execute_workflow(WorkflowType::MedicationReview, &WorkflowContext::new(), None)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.metadata["wave_count"], json!(2));
        assert!(result.parallel_efficiency > 0.0 && result.parallel_efficiency <= 1.0);
        assert!(result.aggregated_content.starts_with("# Medication Review"));
        assert!(result.aggregated_content.contains("## Patient Instructions"));
    }
}
