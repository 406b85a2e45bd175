//! Error types for the financial agent workflow

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Error, Debug)]
pub enum WorkflowError {

    // =============================
    // Proposal Lifecycle Errors
    // =============================

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for proposal {proposal_id}: {from} -> {to}")]
    InvalidTransition {
        proposal_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Unknown proposal type: {0}")]
    UnknownProposalType(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Proposal mismatch: {0}")]
    ProposalMismatch(String),

    #[error("Duplicate proposal: {0}")]
    DuplicateProposal(String),

    // =============================
    // Agent Errors
    // =============================

    #[error("Agent error: {0}")]
    AgentError(String),

    #[error("Agent timed out after {0} ms")]
    AgentTimeout(u64),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("No revised proposal after {0} attempt(s)")]
    NoRevisedProposal(u32),

    // =============================
    // Infrastructure Errors
    // =============================

    #[error("Record store error: {0}")]
    StoreError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WorkflowError {
    /// Errors caused by the caller's request. These never leave partial state behind.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            WorkflowError::NotFound(_)
                | WorkflowError::InvalidTransition { .. }
                | WorkflowError::UnknownProposalType(_)
                | WorkflowError::PreconditionFailed(_)
                | WorkflowError::ProposalMismatch(_)
        )
    }

    /// Agent-side failures happen before any tool call mutates state,
    /// so the whole trigger event can be sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::AgentError(_)
                | WorkflowError::AgentTimeout(_)
                | WorkflowError::PolicyViolation(_)
                | WorkflowError::LlmError(_)
                | WorkflowError::HttpError(_)
                | WorkflowError::NoRevisedProposal(_)
        )
    }
}
