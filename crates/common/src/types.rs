//! Closed domain types shared by every component
//!
//! Agent types and priorities arrive as strings from the route layer. They are
//! parsed here, once, so nothing unknown ever reaches the queue or the router.

use crate::error::{Result, TriageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single chat message in OpenAI format
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Logical capability category of a request
///
/// Each agent type maps to exactly one model configuration in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Clinical,
    Billing,
    Claims,
    Pharmacy,
    Radiology,
    Translation,
    General,
}

impl AgentType {
    pub const ALL: [AgentType; 7] = [
        AgentType::Clinical,
        AgentType::Billing,
        AgentType::Claims,
        AgentType::Pharmacy,
        AgentType::Radiology,
        AgentType::Translation,
        AgentType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Clinical => "clinical",
            AgentType::Billing => "billing",
            AgentType::Claims => "claims",
            AgentType::Pharmacy => "pharmacy",
            AgentType::Radiology => "radiology",
            AgentType::Translation => "translation",
            AgentType::General => "general",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        AgentType::ALL
            .iter()
            .copied()
            .find(|agent| agent.as_str() == normalized)
            .ok_or_else(|| TriageError::UnknownAgentType(s.to_string()))
    }
}

/// Request priority level
///
/// Ordering follows the numeric value, so `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    /// Tiers in dequeue order, highest first
    pub fn descending() -> [Priority; 4] {
        [
            Priority::Critical,
            Priority::High,
            Priority::Normal,
            Priority::Low,
        ]
    }

    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Index of this tier in a four-slot array (Low = 0)
    pub fn index(&self) -> usize {
        self.value() as usize - 1
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

impl TryFrom<u8> for Priority {
    type Error = TriageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Critical),
            other => Err(TriageError::InvalidPriority(other.to_string())),
        }
    }
}

impl FromStr for Priority {
    type Err = TriageError;

    /// Accepts names (`"high"`, `"CRITICAL"`) or numeric values (`"3"`)
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(value) = trimmed.parse::<u8>() {
            return Priority::try_from(value);
        }

        match trimmed.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "NORMAL" => Ok(Priority::Normal),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" => Ok(Priority::Critical),
            _ => Err(TriageError::InvalidPriority(s.to_string())),
        }
    }
}

/// Serving engine a model instance runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// High-throughput continuous-batching server
    Vllm,

    /// Quantized, memory-efficient server with low single-request latency
    LlamaCpp,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Vllm => "vllm",
            BackendKind::LlamaCpp => "llama_cpp",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
