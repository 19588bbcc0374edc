use crate::model::{RunId, Stage};
use thiserror::Error;

/// Failure reported by a warehouse call.
///
/// Only [`GatewayError::is_infrastructure`] errors abort a run; everything
/// else is recorded against the candidate that triggered it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("warehouse unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("statement failed: {0}")]
    Execution(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("metrics not yet available for query {0}")]
    MetricsNotYetAvailable(String),

    #[error("statement rejected (read-only scope): {0}")]
    ReadOnlyViolation(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("unexpected warehouse response: {0}")]
    Protocol(String),
}

impl GatewayError {
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, GatewayError::Unreachable(_) | GatewayError::Auth(_))
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("infrastructure failure during {stage}: {message}")]
    Infrastructure { stage: Stage, message: String },

    #[error("run {0} was cancelled")]
    Cancelled(RunId),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("run {0} is already advancing")]
    RunBusy(RunId),

    #[error("run {0} has already finished")]
    RunFinished(RunId),

    #[error("stage {stage} cannot be retried for run {run_id}")]
    RetryNotAllowed { run_id: RunId, stage: Stage },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    pub fn infrastructure(stage: Stage, err: &GatewayError) -> Self {
        WorkflowError::Infrastructure {
            stage,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connectivity_errors_are_infrastructure() {
        assert!(GatewayError::Unreachable("dns".into()).is_infrastructure());
        assert!(GatewayError::Auth("expired token".into()).is_infrastructure());
        assert!(!GatewayError::TableNotFound("ORDERS".into()).is_infrastructure());
        assert!(!GatewayError::MetricsNotYetAvailable("01a".into()).is_infrastructure());
        assert!(!GatewayError::Timeout(30).is_infrastructure());
    }

    #[test]
    fn infrastructure_error_names_stage() {
        let err = WorkflowError::infrastructure(
            Stage::Discover,
            &GatewayError::Unreachable("connection refused".into()),
        );
        assert_eq!(
            err.to_string(),
            "infrastructure failure during discover: warehouse unreachable: connection refused"
        );
    }
}
