//! Tool dispatch for `TOOL_CALL` nodes.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::ToolError;
use crate::http::{self, HttpRequestArgs};
use crate::mcp::{self, McpEnvelope};

/// Default local MCP endpoint.
pub const DEFAULT_MCP_ENDPOINT: &str = "http://127.0.0.1:3333/mcp/call";

/// Anything that can execute a named tool with JSON arguments.
///
/// The runner depends on this trait rather than on [`ToolExecutor`]
/// directly so tests can substitute deterministic fakes.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Execute `tool` with `args`, returning the parsed response.
    async fn invoke(&self, tool: &str, args: &Value) -> Result<Value, ToolError>;
}

/// Resolved dispatch target for a tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolTarget {
    /// `http.request`
    Http,
    /// `mcp:<server>:<tool>`
    Mcp { server: String, tool: String },
}

impl ToolTarget {
    /// Parse a tool name into its dispatch target.
    pub fn parse(name: &str) -> Result<Self, ToolError> {
        if name == http::TOOL_NAME {
            return Ok(ToolTarget::Http);
        }

        if let Some(rest) = name.strip_prefix("mcp:") {
            if let Some((server, tool)) = rest.split_once(':') {
                if !server.is_empty() && !tool.is_empty() {
                    return Ok(ToolTarget::Mcp {
                        server: server.to_string(),
                        tool: tool.to_string(),
                    });
                }
            }
        }

        Err(ToolError::Unsupported(name.to_string()))
    }
}

/// Tool executor configuration.
#[derive(Debug, Clone)]
pub struct ToolExecutorConfig {
    /// Endpoint receiving MCP envelopes.
    pub mcp_endpoint: String,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ToolExecutorConfig {
    fn default() -> Self {
        Self {
            mcp_endpoint: DEFAULT_MCP_ENDPOINT.to_string(),
            timeout_secs: 30,
        }
    }
}

/// Executes `http.request` and `mcp:*` tools over a shared HTTP client.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    client: reqwest::Client,
    config: ToolExecutorConfig,
}

impl ToolExecutor {
    /// Create a new executor.
    pub fn new(config: ToolExecutorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { client, config }
    }

    /// Create an executor with a custom client.
    pub fn with_client(client: reqwest::Client, config: ToolExecutorConfig) -> Self {
        Self { client, config }
    }

    /// Execute a tool by name.
    pub async fn execute(&self, tool: &str, args: &Value) -> Result<Value, ToolError> {
        match ToolTarget::parse(tool)? {
            ToolTarget::Http => {
                let request = HttpRequestArgs::from_value(args)?;
                http::send(&self.client, &request).await
            }
            ToolTarget::Mcp { server, tool } => {
                let envelope = McpEnvelope {
                    server,
                    tool,
                    arguments: args.clone(),
                };
                mcp::call(&self.client, &self.config.mcp_endpoint, &envelope).await
            }
        }
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new(ToolExecutorConfig::default())
    }
}

#[async_trait]
impl ToolInvoker for ToolExecutor {
    async fn invoke(&self, tool: &str, args: &Value) -> Result<Value, ToolError> {
        self.execute(tool, args).await
    }
}
