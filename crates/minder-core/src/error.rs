use thiserror::Error;

/// Cross-cutting classification of every boundary failure.
///
/// Each crate keeps its own thiserror enum for local detail; anything that
/// crosses a component boundary maps into one of these kinds so the
/// pipeline can decide recovery policy without downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserInputInvalid,
    AdmissionDenied,
    RateLimited,
    UpstreamUnavailable,
    ToolExecutionFailed,
    ToolPolicyDenied,
    ConfirmationDenied,
    BudgetExceeded,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Short code string for logs and wire payloads.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::UserInputInvalid => "USER_INPUT_INVALID",
            ErrorKind::AdmissionDenied => "ADMISSION_DENIED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorKind::ToolExecutionFailed => "TOOL_EXECUTION_FAILED",
            ErrorKind::ToolPolicyDenied => "TOOL_POLICY_DENIED",
            ErrorKind::ConfirmationDenied => "CONFIRMATION_DENIED",
            ErrorKind::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum MinderError {
    #[error("Invalid input: {0}")]
    UserInputInvalid(String),

    #[error("Not authorized: {0}")]
    AdmissionDenied(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Upstream {service} unavailable: {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    #[error("Tool '{tool}' failed: {reason}")]
    ToolExecutionFailed { tool: String, reason: String },

    #[error("Tool '{tool}' denied by policy")]
    ToolPolicyDenied { tool: String },

    #[error("Confirmation denied for tool '{tool}'")]
    ConfirmationDenied { tool: String },

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MinderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MinderError::UserInputInvalid(_) => ErrorKind::UserInputInvalid,
            MinderError::AdmissionDenied(_) => ErrorKind::AdmissionDenied,
            MinderError::RateLimited { .. } => ErrorKind::RateLimited,
            MinderError::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            MinderError::ToolExecutionFailed { .. } => ErrorKind::ToolExecutionFailed,
            MinderError::ToolPolicyDenied { .. } => ErrorKind::ToolPolicyDenied,
            MinderError::ConfirmationDenied { .. } => ErrorKind::ConfirmationDenied,
            MinderError::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            MinderError::Cancelled => ErrorKind::Cancelled,
            MinderError::Config(_)
            | MinderError::Serialization(_)
            | MinderError::Io(_)
            | MinderError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Convenience constructor for LLM/MCP/voice/RAG transport failures.
    pub fn upstream(service: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        MinderError::UpstreamUnavailable {
            service: service.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MinderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ErrorKind::RateLimited.code(), "RATE_LIMITED");
        assert_eq!(ErrorKind::BudgetExceeded.code(), "BUDGET_EXCEEDED");
    }

    #[test]
    fn cancelled_maps_to_cancelled_kind() {
        assert_eq!(MinderError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn upstream_constructor_carries_service() {
        let e = MinderError::upstream("llm", "connection refused");
        assert_eq!(e.kind(), ErrorKind::UpstreamUnavailable);
        assert!(e.to_string().contains("llm"));
    }
}
