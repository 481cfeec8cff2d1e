//! Common error types for Triage
//!
//! This module defines all error types used across the control plane.
//! Admission and configuration errors are surfaced to callers; transient
//! backend and telemetry errors are absorbed by the router and monitor.

use thiserror::Error;

/// Main error type for Triage
#[derive(Error, Debug)]
pub enum TriageError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Admission rejected because the queue is at capacity
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// No task with this id is tracked
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Unknown priority name or value
    #[error("Invalid priority: {0}")]
    InvalidPriority(String),

    /// Unknown agent type, or an agent type with no registered model
    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    /// Lifecycle transition not allowed from the task's current status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Workflow graph cannot be fully resolved (cycle or dangling dependency)
    #[error("Unsatisfiable dependency: {0}")]
    UnsatisfiableDependency(String),

    /// No registered model fits in available GPU memory
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Backend call exceeded its timeout
    #[error("Backend timeout: {0}")]
    BackendTimeout(String),

    /// Backend unreachable or returned an error
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// GPU telemetry could not be read
    #[error("Telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    /// Task elapsed past its deadline while non-terminal
    #[error("Task timed out: {0}")]
    TaskTimeout(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TriageError {
    /// HTTP status code the route layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            TriageError::QueueFull(_) => 429,
            TriageError::TaskNotFound(_) => 404,
            TriageError::InvalidPriority(_)
            | TriageError::UnknownAgentType(_)
            | TriageError::InvalidInput(_) => 400,
            TriageError::InvalidState(_) => 409,
            TriageError::UnsatisfiableDependency(_) => 422,
            TriageError::ResourceExhausted(_)
            | TriageError::BackendUnavailable(_)
            | TriageError::TelemetryUnavailable(_) => 503,
            TriageError::BackendTimeout(_) | TriageError::TaskTimeout(_) => 504,
            TriageError::Config(_)
            | TriageError::Serialization(_)
            | TriageError::Io(_)
            | TriageError::Internal(_) => 500,
        }
    }

    /// Whether a backend call that failed with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TriageError::BackendTimeout(_) | TriageError::BackendUnavailable(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        TriageError::Config(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        TriageError::QueueFull(msg.into())
    }

    /// Create a task not found error
    pub fn task_not_found(id: impl Into<String>) -> Self {
        TriageError::TaskNotFound(id.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        TriageError::InvalidState(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        TriageError::InvalidInput(msg.into())
    }

    /// Create an unsatisfiable dependency error
    pub fn unsatisfiable(msg: impl Into<String>) -> Self {
        TriageError::UnsatisfiableDependency(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        TriageError::ResourceExhausted(msg.into())
    }

    /// Create a backend timeout error
    pub fn backend_timeout(msg: impl Into<String>) -> Self {
        TriageError::BackendTimeout(msg.into())
    }

    /// Create a backend unavailable error
    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        TriageError::BackendUnavailable(msg.into())
    }

    /// Create a telemetry unavailable error
    pub fn telemetry(msg: impl Into<String>) -> Self {
        TriageError::TelemetryUnavailable(msg.into())
    }

    /// Create a task timeout error
    pub fn task_timeout(msg: impl Into<String>) -> Self {
        TriageError::TaskTimeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        TriageError::Internal(msg.into())
    }
}

/// Result type alias for Triage operations
pub type Result<T> = std::result::Result<T, TriageError>;
