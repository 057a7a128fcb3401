//! execflow control plane library
//!
//! Compiles editor workflow graphs into ExecIR, runs ExecIR programs and
//! exposes every run as a durable, replayable event stream.
//!
//! ## Architecture
//!
//! A run executes sequentially on its own tokio task. Each event it emits
//! is persisted before being broadcast, so subscribers that join late or
//! reconnect replay the stored backlog and continue live without gaps or
//! duplicates.
//!
//! ## Modules
//!
//! - [`compiler`]: Graph analysis and lowering to ExecIR
//! - [`execir`]: The ExecIR program model and state references
//! - [`engine`]: The runner and its collaborators (prompts, validation, repair)
//! - [`events`]: Event envelopes, redaction and SSE framing
//! - [`db`]: Event store trait with SQLite and in-memory implementations
//! - [`services`]: Run lifecycle management and event fan-out
//! - [`handlers`]: HTTP route handlers
//! - [`config`]: Configuration loading from environment variables
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use execflow_control_plane::{
//!     config::{AppConfig, DatabaseConfig},
//!     db::{create_pool, SqliteEventStore},
//!     engine::{Runner, UnconfiguredProvider},
//!     services::RunManager,
//!     state::AppState,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = create_pool(&DatabaseConfig::from_env()?).await?;
//!     let runner = Runner::new(Arc::new(UnconfiguredProvider), tools);
//!     let manager = RunManager::new(Arc::new(SqliteEventStore::new(pool)), Arc::new(runner));
//!     let state = AppState::new(Arc::new(manager), AppConfig::from_env()?, None);
//!     // ... build and run server
//!     Ok(())
//! }
//! ```

pub mod compiler;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod execir;
pub mod handlers;
pub mod result_ext;
pub mod services;
pub mod state;
pub mod template;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
