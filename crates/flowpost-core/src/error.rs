//! Error types for Flowpost.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FlowpostError>;

/// Errors surfaced by Flowpost components.
///
/// Per-run failures are not errors at this level: they are recorded on the
/// run itself. These variants cover call-level failures (bad input, missing
/// flow, storage trouble, auth).
#[derive(Debug, Error)]
pub enum FlowpostError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Flow {0} has no trigger node")]
    NoTrigger(String),

    #[error("Invalid flow: {0}")]
    InvalidFlow(String),

    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Tenant mismatch: {0}")]
    TenantMismatch(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowpostError {
    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG",
            Self::Database(_) => "DATABASE",
            Self::FlowNotFound(_) => "FLOW_NOT_FOUND",
            Self::NoTrigger(_) => "NO_TRIGGER",
            Self::InvalidFlow(_) => "INVALID_FLOW",
            Self::RecipientNotFound(_) => "RECIPIENT_NOT_FOUND",
            Self::RunNotFound(_) => "RUN_NOT_FOUND",
            Self::TenantMismatch(_) => "TENANT_MISMATCH",
            Self::Gateway(_) => "GATEWAY",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Io(_) => "IO",
            Self::Json(_) => "JSON",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(FlowpostError::NoTrigger("f1".into()).code(), "NO_TRIGGER");
        assert_eq!(
            FlowpostError::TenantMismatch("x".into()).code(),
            "TENANT_MISMATCH"
        );
    }

    #[test]
    fn test_display_includes_detail() {
        let err = FlowpostError::FlowNotFound("abc".into());
        assert_eq!(err.to_string(), "Flow not found: abc");
    }
}
