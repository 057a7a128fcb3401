//! Application configuration for the execflow control plane.

use serde::Deserialize;
use std::time::Duration;

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `EXECFLOW_`:
/// - `EXECFLOW_HOST`: Server bind address (default: "0.0.0.0")
/// - `EXECFLOW_PORT`: Server port (default: 8090)
/// - `EXECFLOW_PROVIDER_URL`: Chat endpoint for `LLM_WRITE` nodes (optional)
/// - `EXECFLOW_PROVIDER_NAME`: Provider name recorded on failures
/// - `EXECFLOW_MCP_ENDPOINT`: Endpoint receiving `mcp:<server>:<tool>` calls
/// - `EXECFLOW_RUN_RETENTION_SECS`: Age after which terminal runs are pruned
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Chat endpoint. Runs with `LLM_WRITE` nodes fail when unset.
    #[serde(default)]
    pub provider_url: Option<String>,

    #[serde(default = "default_provider_name")]
    pub provider_name: String,

    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,

    #[serde(default = "default_mcp_endpoint")]
    pub mcp_endpoint: String,

    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Terminal runs untouched for longer than this are pruned
    #[serde(default = "default_run_retention")]
    pub run_retention_secs: u64,

    /// Prune sweep interval in seconds
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_provider_name() -> String {
    "gateway".to_string()
}

fn default_provider_timeout() -> u64 {
    120
}

fn default_mcp_endpoint() -> String {
    "http://127.0.0.1:3333/mcp/call".to_string()
}

fn default_tool_timeout() -> u64 {
    30
}

fn default_run_retention() -> u64 {
    7 * 24 * 60 * 60
}

fn default_prune_interval() -> u64 {
    300
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `EXECFLOW_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("EXECFLOW_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn run_retention(&self) -> Duration {
        Duration::from_secs(self.run_retention_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            provider_url: None,
            provider_name: default_provider_name(),
            provider_timeout_secs: default_provider_timeout(),
            mcp_endpoint: default_mcp_endpoint(),
            tool_timeout_secs: default_tool_timeout(),
            run_retention_secs: default_run_retention(),
            prune_interval_secs: default_prune_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8090);
        assert!(config.provider_url.is_none());
        assert_eq!(config.run_retention(), Duration::from_secs(604_800));
    }

    #[test]
    fn test_bind_address() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8090");
    }

    #[test]
    fn test_from_iter_overrides() {
        let config: AppConfig = envy::prefixed("EXECFLOW_")
            .from_iter(vec![
                ("EXECFLOW_PORT".to_string(), "9000".to_string()),
                ("EXECFLOW_PROVIDER_URL".to_string(), "http://llm:8080/chat".to_string()),
                ("EXECFLOW_PRUNE_INTERVAL_SECS".to_string(), "0".to_string()),
            ])
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.provider_url.as_deref(), Some("http://llm:8080/chat"));
        assert_eq!(config.prune_interval(), Duration::from_secs(1));
        assert_eq!(config.mcp_endpoint, default_mcp_endpoint());
    }
}
