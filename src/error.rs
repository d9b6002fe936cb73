//! Error taxonomy for the message pipeline and lifecycle operations.
//!
//! Every failure surfaced by the engine is an [`EngineError`]. Callers
//! that only need the coarse class (to pick an HTTP status or decide
//! whether to retry) use [`EngineError::kind`].

use serde::{Deserialize, Serialize};

use crate::models::str_enum;

str_enum! {
    /// Pipeline stage, used for timeouts and failure audits.
    pub enum Stage {
        Validate => "validate",
        Redact => "redact",
        Retrieve => "retrieve",
        Compose => "compose",
        Decide => "decide",
        Persist => "persist",
    }
}

/// Coarse error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input; rejected before the pipeline runs.
    Validation,
    /// Bad rule, source or tenant configuration.
    Configuration,
    /// Embedding provider, storage or audit log unavailable.
    Dependency,
    /// Illegal lifecycle transition.
    State,
    /// A stage exceeded its time budget.
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("tenant {0} is inactive")]
    TenantInactive(String),

    #[error("invalid pattern in redaction rule {rule_id}: {message}")]
    InvalidPattern { rule_id: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("embedding dimension mismatch: query has {actual}, stored chunks have {expected}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("audit write failed: {0:#}")]
    AuditFailure(#[source] anyhow::Error),

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("pipeline stage '{stage}' exceeded its {budget_ms}ms budget")]
    PipelineTimeout { stage: Stage, budget_ms: u64 },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_)
            | EngineError::NotFound { .. }
            | EngineError::TenantInactive(_) => ErrorKind::Validation,
            EngineError::InvalidPattern { .. }
            | EngineError::Configuration(_)
            | EngineError::EmbeddingDimensionMismatch { .. } => ErrorKind::Configuration,
            EngineError::ProviderUnavailable(_)
            | EngineError::Storage(_)
            | EngineError::AuditFailure(_) => ErrorKind::Dependency,
            EngineError::InvalidTransition { .. } => ErrorKind::State,
            EngineError::PipelineTimeout { .. } => ErrorKind::Timeout,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
