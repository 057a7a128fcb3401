//! execflow Tool Library
//!
//! Deterministic external calls made by `TOOL_CALL` nodes. Dispatch is by
//! tool name:
//!
//! - `http.request`: a plain HTTP call built from the node arguments
//! - `mcp:<server>:<tool>`: a structured envelope posted to the local MCP endpoint
//!
//! Any other name fails with [`ToolError::Unsupported`].

pub mod error;
pub mod executor;
pub mod http;
pub mod mcp;

pub use error::ToolError;
pub use executor::{ToolExecutor, ToolExecutorConfig, ToolInvoker, ToolTarget};
pub use http::{HttpMethod, HttpRequestArgs};
pub use mcp::McpEnvelope;

/// Parse a response body as JSON, falling back to the raw text.
pub(crate) fn parse_body(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}
