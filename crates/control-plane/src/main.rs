//! execflow control plane server
//!
//! Serves the workflow compiler, runs ExecIR programs and streams their
//! events over SSE.

use std::net::SocketAddr;
use std::sync::Arc;

use execflow_tools::{ToolExecutor, ToolExecutorConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use execflow_control_plane::{
    config::{AppConfig, DatabaseConfig},
    db::{create_pool, SqliteEventStore},
    engine::{HttpChatProvider, LlmProvider, Runner, UnconfiguredProvider},
    handlers,
    services::RunManager,
    state::AppState,
};

/// Initialize tracing/logging. `EXECFLOW_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,execflow_control_plane=debug,tower_http=debug".into());
    let json = std::env::var("EXECFLOW_LOG_FORMAT").is_ok_and(|format| format == "json");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_provider(config: &AppConfig) -> Arc<dyn LlmProvider> {
    match &config.provider_url {
        Some(url) => {
            tracing::info!(url = %url, name = %config.provider_name, "Using HTTP chat provider");
            Arc::new(HttpChatProvider::new(
                config.provider_name.as_str(),
                url.as_str(),
                config.provider_timeout(),
            ))
        }
        None => {
            tracing::warn!("EXECFLOW_PROVIDER_URL not set, LLM_WRITE nodes will fail");
            Arc::new(UnconfiguredProvider)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting execflow control plane"
    );

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        database = %db_config.url,
        "Configuration loaded"
    );

    let db_pool = create_pool(&db_config).await?;
    let store = Arc::new(SqliteEventStore::new(db_pool.clone()));

    let tools = ToolExecutor::new(ToolExecutorConfig {
        mcp_endpoint: app_config.mcp_endpoint.clone(),
        timeout_secs: app_config.tool_timeout_secs,
    });
    let runner = Runner::new(build_provider(&app_config), Arc::new(tools));
    let manager = Arc::new(RunManager::new(store, Arc::new(runner)));

    let recovered = manager.recover_interrupted_runs().await?;
    tracing::info!(recovered, "Startup recovery finished");

    let shutdown = CancellationToken::new();
    let prune_task = manager.clone().spawn_prune_loop(
        app_config.run_retention(),
        app_config.prune_interval(),
        shutdown.clone(),
    );

    let state = AppState::new(manager, app_config.clone(), Some(db_pool));
    let app = handlers::router(state);

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    let _ = prune_task.await;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
