//! Normalization of provider and tool failures into a closed taxonomy.

use execflow_tools::ToolError;
use serde::{Deserialize, Serialize};

use super::provider::ProviderError;

/// Failure classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    Auth,
    RateLimit,
    Timeout,
    Network,
    InvalidResponse,
    ProviderUnavailable,
    Unknown,
}

impl FailureCode {
    /// Whether a caller may reasonably retry. The runner itself never does.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureCode::RateLimit
                | FailureCode::Timeout
                | FailureCode::Network
                | FailureCode::ProviderUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::Auth => "auth",
            FailureCode::RateLimit => "rate_limit",
            FailureCode::Timeout => "timeout",
            FailureCode::Network => "network",
            FailureCode::InvalidResponse => "invalid_response",
            FailureCode::ProviderUnavailable => "provider_unavailable",
            FailureCode::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized failure attached to `stage.failed` and `run.failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderFailure {
    pub code: FailureCode,
    pub provider: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub message: String,
}

impl ProviderFailure {
    pub fn new(code: FailureCode, provider: &str, status_code: Option<u16>, message: String) -> Self {
        Self {
            code,
            provider: provider.to_string(),
            retryable: code.is_retryable(),
            status_code,
            message,
        }
    }

    pub fn from_provider_error(provider: &str, error: &ProviderError) -> Self {
        let code = classify(
            error.status_code,
            error.code.as_deref(),
            error.name.as_deref(),
            &error.message,
        );
        Self::new(code, provider, error.status_code, error.message.clone())
    }

    pub fn from_tool_error(tool: &str, error: &ToolError) -> Self {
        let code = match error {
            ToolError::Timeout(_) => FailureCode::Timeout,
            ToolError::Network(_) => FailureCode::Network,
            ToolError::HttpStatus { status, .. } => classify_status(*status),
            ToolError::Json(_) => FailureCode::InvalidResponse,
            ToolError::Http(message) => classify(None, None, None, message),
            ToolError::Unsupported(_) | ToolError::InvalidArguments { .. } => FailureCode::Unknown,
        };
        Self::new(code, tool, error.status_code(), error.to_string())
    }

    /// Failure not tied to a provider or tool call.
    pub fn from_message(provider: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let code = classify(None, None, None, &message);
        Self::new(code, provider, None, message)
    }
}

fn classify_status(status: u16) -> FailureCode {
    match status {
        401 | 403 => FailureCode::Auth,
        429 => FailureCode::RateLimit,
        408 | 504 => FailureCode::Timeout,
        500 | 502 | 503 => FailureCode::ProviderUnavailable,
        _ => FailureCode::Unknown,
    }
}

/// Classify from status code, then transport error code, then error name
/// and message heuristics.
pub fn classify(
    status: Option<u16>,
    code: Option<&str>,
    name: Option<&str>,
    message: &str,
) -> FailureCode {
    if let Some(status) = status {
        let by_status = classify_status(status);
        if by_status != FailureCode::Unknown {
            return by_status;
        }
    }

    if let Some(code) = code {
        match code.to_ascii_uppercase().as_str() {
            "ETIMEDOUT" | "ECONNABORTED" | "ESOCKETTIMEDOUT" => return FailureCode::Timeout,
            "ECONNRESET" | "ECONNREFUSED" | "ENOTFOUND" | "EAI_AGAIN" | "EPIPE"
            | "EHOSTUNREACH" => return FailureCode::Network,
            _ => {}
        }
    }

    let haystack = format!("{} {}", name.unwrap_or_default(), message).to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| haystack.contains(n));

    if any(&["timeout", "timed out", "aborterror"]) {
        FailureCode::Timeout
    } else if any(&["rate limit", "rate_limit", "too many requests"]) {
        FailureCode::RateLimit
    } else if any(&["unauthorized", "forbidden", "invalid api key", "authentication"]) {
        FailureCode::Auth
    } else if any(&["econnreset", "econnrefused", "enotfound", "network", "socket hang up"]) {
        FailureCode::Network
    } else if any(&["syntaxerror", "invalid json", "invalid response", "parse error"]) {
        FailureCode::InvalidResponse
    } else if any(&["overloaded", "unavailable"]) {
        FailureCode::ProviderUnavailable
    } else {
        FailureCode::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (401, FailureCode::Auth),
            (403, FailureCode::Auth),
            (429, FailureCode::RateLimit),
            (408, FailureCode::Timeout),
            (504, FailureCode::Timeout),
            (500, FailureCode::ProviderUnavailable),
            (503, FailureCode::ProviderUnavailable),
            (418, FailureCode::Unknown),
        ];
        for (status, expected) in cases {
            let error = ProviderError::new("boom").with_status(status);
            let failure = ProviderFailure::from_provider_error("openai", &error);
            assert_eq!(failure.code, expected, "status {status}");
            assert_eq!(failure.status_code, Some(status));
        }
    }

    #[test]
    fn test_error_codes_and_names() {
        let reset = ProviderError::new("socket closed").with_code("ECONNRESET");
        assert_eq!(
            ProviderFailure::from_provider_error("p", &reset).code,
            FailureCode::Network
        );

        let timeout = ProviderError::new("request aborted").with_name("TimeoutError");
        assert_eq!(
            ProviderFailure::from_provider_error("p", &timeout).code,
            FailureCode::Timeout
        );

        let parse = ProviderError::new("Unexpected token <").with_name("SyntaxError");
        assert_eq!(
            ProviderFailure::from_provider_error("p", &parse).code,
            FailureCode::InvalidResponse
        );
    }

    #[test]
    fn test_unknown_is_not_retryable() {
        let failure = ProviderFailure::from_message("runtime", "something odd");
        assert_eq!(failure.code, FailureCode::Unknown);
        assert!(!failure.retryable);
    }

    #[test]
    fn test_retryability() {
        let limited = ProviderFailure::from_provider_error("p", &ProviderError::new("x").with_status(429));
        assert!(limited.retryable);
        let auth = ProviderFailure::from_provider_error("p", &ProviderError::new("x").with_status(401));
        assert!(!auth.retryable);
    }

    #[test]
    fn test_tool_errors() {
        let status = ToolError::HttpStatus {
            status: 502,
            body: "bad gateway".to_string(),
        };
        let failure = ProviderFailure::from_tool_error("http.request", &status);
        assert_eq!(failure.code, FailureCode::ProviderUnavailable);
        assert_eq!(failure.provider, "http.request");

        let unsupported = ToolError::Unsupported("shell".to_string());
        assert_eq!(
            ProviderFailure::from_tool_error("shell", &unsupported).code,
            FailureCode::Unknown
        );
    }

    #[test]
    fn test_wire_shape() {
        let failure = ProviderFailure::from_provider_error("p", &ProviderError::new("x").with_status(429));
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["code"], "rate_limit");
        assert_eq!(value["statusCode"], 429);
        assert_eq!(value["retryable"], true);
    }
}
