//! Task and batch records owned by the queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use triage_common::{AgentType, ChatMessage, Priority};

/// Default deadline for a task
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Default retry budget for a task
pub const DEFAULT_RETRIES: u32 = 3;

/// Default generation length
pub const DEFAULT_MAX_TOKENS: u32 = 512;

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Lifecycle status of an inference task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Batched,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Queued,
        TaskStatus::Batched,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Timeout,
    ];

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Batched => "BATCHED",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// A single inference request tracked by the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceTask {
    /// Unique task identifier
    pub id: String,

    pub agent_type: AgentType,
    pub messages: Vec<ChatMessage>,
    pub priority: Priority,
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Deadline measured from `created_at`
    pub timeout_seconds: u64,

    /// Remaining failures before the task becomes terminal FAILED
    pub retries_left: u32,

    /// Generation parameters
    pub max_tokens: u32,
    pub temperature: f32,

    /// Model requested by the caller, if any
    pub model_preference: Option<String>,

    pub result: Option<String>,
    pub error: Option<String>,
    pub batch_id: Option<String>,

    /// Dequeue-to-completion time of the successful attempt
    pub processing_time_ms: Option<f64>,
}

impl InferenceTask {
    /// Create a new queued task with default parameters
    pub fn new(agent_type: AgentType, messages: Vec<ChatMessage>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_type,
            messages,
            priority: Priority::Normal,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            retries_left: DEFAULT_RETRIES,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            model_preference: None,
            result: None,
            error: None,
            batch_id: None,
            processing_time_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_left = retries;
        self
    }

    pub fn with_model_preference(mut self, model: impl Into<String>) -> Self {
        self.model_preference = Some(model.into());
        self
    }

    pub fn with_generation(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Seconds since the task was created
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds() as f64 / 1000.0
    }

    /// Whether the task has outlived its deadline
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.elapsed_seconds(now) > self.timeout_seconds as f64
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A group of same-agent-type tasks dispatched together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBatch {
    pub batch_id: String,
    pub agent_type: AgentType,

    /// Member tasks, in formation order
    pub task_ids: Vec<String>,

    /// Model the batch was formed for
    pub model_name: String,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskBatch {
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }
}

/// Read-only view of a batch and the current state of its tasks
#[derive(Debug, Clone, Serialize)]
pub struct BatchResults {
    pub batch: TaskBatch,
    pub tasks: Vec<InferenceTask>,
}

impl BatchResults {
    /// Whether every member task reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(InferenceTask::is_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_defaults() {
        let task = InferenceTask::new(AgentType::Clinical, vec![ChatMessage::user("hi")]);

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(task.timeout_seconds, 300);
        assert_eq!(task.retries_left, 3);
        assert_eq!(task.max_tokens, 512);
        assert!((task.temperature - 0.7).abs() < f32::EPSILON);
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_expiry() {
        let mut task = InferenceTask::new(AgentType::Billing, vec![]).with_timeout(5);
        let now = Utc::now();
        assert!(!task.is_expired(now));

        task.created_at = now - chrono::Duration::seconds(6);
        assert!(task.is_expired(now));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Batched.is_terminal());
    }
}
