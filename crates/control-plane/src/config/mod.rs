//! Configuration for the execflow control plane.
//!
//! Loaded from environment variables with `envy`, after `dotenvy` has read
//! any `.env` file.

mod app;
mod database;

pub use app::AppConfig;
pub use database::DatabaseConfig;
