use thiserror::Error;
use uuid::Uuid;

use viva_agent::GatewayError;

/// Failures while creating or tearing down a session.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("unknown persona: {0}")]
    InvalidPersona(String),
    #[error("interview not found: {0}")]
    InterviewNotFound(Uuid),
    #[error("interview {0} has no persona binding")]
    PersonaMissing(Uuid),
    #[error(transparent)]
    Upstream(#[from] GatewayError),
    #[error("storage failure: {0}")]
    Persistence(anyhow::Error),
}

/// Failures of one relayed turn.
///
/// Validation and upstream errors happen before anything was shown to the
/// caller and fail the request. In streaming mode, failures after the first
/// forwarded frame are delivered in-band as an `error` frame instead —
/// bytes already sent cannot be retracted.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing or malformed required field: {0}")]
    Validation(&'static str),
    #[error("interview not found: {0}")]
    InterviewNotFound(String),
    #[error("interview has no persona binding")]
    MissingAgentBinding,
    #[error(transparent)]
    Upstream(#[from] GatewayError),
    #[error("storage failure: {0}")]
    Persistence(anyhow::Error),
}
