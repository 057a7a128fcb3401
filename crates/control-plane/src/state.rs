//! Shared application state passed to every handler through axum's
//! state extractor.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::services::RunManager;

#[derive(Clone)]
pub struct AppState {
    /// Owns run lifecycles and event fan-out
    pub runs: Arc<RunManager>,

    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Present when runs are persisted in SQLite
    pub db: Option<DbPool>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(runs: Arc<RunManager>, config: AppConfig, db: Option<DbPool>) -> Self {
        Self {
            runs,
            config: Arc::new(config),
            db,
            start_time: std::time::Instant::now(),
        }
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
