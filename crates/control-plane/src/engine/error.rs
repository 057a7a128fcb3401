//! Runtime errors raised while executing a node.

use execflow_tools::ToolError;
use thiserror::Error;

use super::failure::{FailureCode, ProviderFailure};
use super::prompt::PromptError;
use super::provider::ProviderError;
use super::state::StateError;
use super::validator::ValidationIssue;
use crate::template::ExpressionError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error("provider {provider} failed: {error}")]
    Provider {
        provider: String,
        error: ProviderError,
    },

    #[error("tool {tool} failed: {source}")]
    Tool {
        tool: String,
        #[source]
        source: ToolError,
    },

    #[error("output of {node_id} failed validation: {message}")]
    Validation {
        node_id: String,
        message: String,
        errors: Vec<ValidationIssue>,
    },

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

impl EngineError {
    /// Normalized failure for `stage.failed` and `run.failed`.
    pub fn failure(&self) -> ProviderFailure {
        match self {
            EngineError::Provider { provider, error } => {
                ProviderFailure::from_provider_error(provider, error)
            }
            EngineError::Tool { tool, source } => ProviderFailure::from_tool_error(tool, source),
            EngineError::Validation { .. } => ProviderFailure::new(
                FailureCode::InvalidResponse,
                "validator",
                None,
                self.to_string(),
            ),
            _ => ProviderFailure::new(FailureCode::Unknown, "runner", None, self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_mapping() {
        let err = EngineError::Provider {
            provider: "gateway".to_string(),
            error: ProviderError::new("slow down").with_status(429),
        };
        let failure = err.failure();
        assert_eq!(failure.code, FailureCode::RateLimit);
        assert!(failure.retryable);
        assert_eq!(failure.provider, "gateway");

        let err = EngineError::Validation {
            node_id: "write".to_string(),
            message: "missing title".to_string(),
            errors: vec![],
        };
        assert_eq!(err.failure().code, FailureCode::InvalidResponse);
        assert!(!err.failure().retryable);

        let err = EngineError::NodeNotFound("ghost".to_string());
        assert_eq!(err.failure().code, FailureCode::Unknown);
    }

    #[test]
    fn test_tool_failure_mapping() {
        let err = EngineError::Tool {
            tool: "http.request".to_string(),
            source: ToolError::HttpStatus {
                status: 503,
                body: String::new(),
            },
        };
        assert_eq!(err.failure().code, FailureCode::ProviderUnavailable);
    }
}
