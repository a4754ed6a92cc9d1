//! Error taxonomy for the extraction and query pipeline.

use thiserror::Error;

/// Errors surfaced by vision-model calls and by pipeline contract checks.
///
/// The split matters operationally: `Transient` is retried with backoff,
/// `MalformedOutput` gets exactly one stricter retry, and
/// `ContractViolation` aborts the whole operation with no fallback.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network failure or timeout talking to the inference endpoint.
    #[error("transient inference error: {0}")]
    Transient(String),

    /// The model returned output that failed schema validation.
    #[error("malformed model output: {0}")]
    MalformedOutput(String),

    /// A policy or configuration invariant was broken. Never downgraded
    /// to a lower-confidence result.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Inference endpoint rejected the request outright.
    #[error("inference endpoint error ({status}): {message}")]
    Endpoint { status: u16, message: String },
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Transient(_) => true,
            // 5xx from a local backend is worth retrying; 4xx is not.
            PipelineError::Endpoint { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, PipelineError::ContractViolation(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
