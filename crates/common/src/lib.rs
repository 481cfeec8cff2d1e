//! Triage common library
//!
//! This crate contains shared code used across the Triage control plane:
//! error taxonomy, configuration, metrics and the closed domain types that
//! are validated at the admission boundary.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

// Re-export commonly used types
pub use config::TriageConfig;
pub use error::{Result, TriageError};
pub use metrics::{MetricsRegistry, METRICS};
pub use types::{AgentType, BackendKind, ChatMessage, Priority};
