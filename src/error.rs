//! Error types for the governor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Job registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("Job id must not be empty")]
    InvalidJobId,

    #[error("Job {id} was cancelled: {reason}")]
    Cancelled { id: String, reason: String },
}

/// Which structural check a completed unit of work failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailKind {
    CountMismatch,
    IdsSubset,
    Placeholders,
}

impl GuardrailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CountMismatch => "count_mismatch",
            Self::IdsSubset => "ids_subset",
            Self::Placeholders => "placeholders",
        }
    }
}

impl std::fmt::Display for GuardrailKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A post-hoc structural check failure.
///
/// Carries the discriminating `kind` and machine-readable `details` so the
/// caller can feed it into escalation without parsing the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} violated in stage {stage}: {message}")]
pub struct InvariantViolation {
    pub kind: GuardrailKind,
    pub stage: String,
    pub message: String,
    pub details: serde_json::Value,
}

/// Failures reported by an outbound call executor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("Remote rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Fatal failure: {0}")]
    Fatal(String),

    #[error("Request aborted: {0}")]
    Aborted(String),
}

/// Result type alias for the governor.
pub type Result<T> = std::result::Result<T, Error>;
