//! Database configuration for the SQLite event store.

use serde::Deserialize;
use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;

/// Database configuration loaded from environment variables.
///
/// Environment variables are prefixed with `EXECFLOW_DB_`:
/// - `EXECFLOW_DB_URL`: SQLite URL (default: "sqlite://execflow.db")
/// - `EXECFLOW_DB_MAX_CONNECTIONS`: Pool size (default: 5)
/// - `EXECFLOW_DB_ACQUIRE_TIMEOUT_SECS`: Acquire timeout (default: 30)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_url")]
    pub url: String,

    /// Maximum connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_url() -> String {
    "sqlite://execflow.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    30
}

impl DatabaseConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("EXECFLOW_DB_").from_env::<DatabaseConfig>()
    }

    /// In-memory database on a single connection, for tests.
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }

    /// SQLite connection options: the file is created if missing and
    /// foreign keys are enforced.
    pub fn connect_options(&self) -> Result<SqliteConnectOptions, sqlx::Error> {
        Ok(SqliteConnectOptions::from_str(&self.url)?
            .create_if_missing(true)
            .foreign_keys(true))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DatabaseConfig::default();
        assert_eq!(config.url, "sqlite://execflow.db");
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn test_connect_options() {
        assert!(DatabaseConfig::in_memory().connect_options().is_ok());
        assert!(DatabaseConfig::default().connect_options().is_ok());
    }
}
