//! Tool execution error types.

use thiserror::Error;

/// Errors that can occur during tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool name does not map to any known dispatcher.
    #[error("Unsupported tool: {0}")]
    Unsupported(String),

    /// Node arguments could not be interpreted for this tool.
    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    /// The request did not complete within the configured timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Connection-level failure (refused, reset, DNS).
    #[error("Network error: {0}")]
    Network(String),

    /// The remote answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Any other HTTP client error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),
}

impl ToolError {
    /// HTTP status code carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ToolError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn invalid(tool: &str, message: impl Into<String>) -> Self {
        ToolError::InvalidArguments {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::Json(e.to_string())
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ToolError::Timeout(e.to_string())
        } else if e.is_connect() {
            ToolError::Network(e.to_string())
        } else if let Some(status) = e.status() {
            ToolError::HttpStatus {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            ToolError::Http(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ToolError::Unsupported("shell".to_string());
        assert_eq!(err.to_string(), "Unsupported tool: shell");

        let err = ToolError::HttpStatus {
            status: 503,
            body: "down".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 503: down");
        assert_eq!(err.status_code(), Some(503));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let tool_err: ToolError = json_err.into();
        assert!(matches!(tool_err, ToolError::Json(_)));
        assert_eq!(tool_err.status_code(), None);
    }
}
