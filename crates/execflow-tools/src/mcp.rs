//! MCP-style tool calls (`mcp:<server>:<tool>`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;
use crate::parse_body;

/// Envelope posted to the local MCP tool endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpEnvelope {
    pub server: String,
    pub tool: String,
    pub arguments: Value,
}

pub(crate) async fn call(
    client: &reqwest::Client,
    endpoint: &str,
    envelope: &McpEnvelope,
) -> Result<Value, ToolError> {
    tracing::debug!(
        server = %envelope.server,
        tool = %envelope.tool,
        endpoint = %endpoint,
        "Calling MCP tool"
    );

    let response = client.post(endpoint).json(envelope).send().await?;
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(ToolError::HttpStatus {
            status: status.as_u16(),
            body: text,
        });
    }

    Ok(parse_body(&text))
}
