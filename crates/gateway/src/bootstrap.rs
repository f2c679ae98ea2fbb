//! Boot path shared by `serve` and tests: validate config, build the pool,
//! bind the listener, and run until shutdown.

use std::sync::Arc;

use lg_domain::config::{Config, ConfigSeverity};
use lg_pool::{Pool, PoolOptions};
use lg_runtime::InferenceRuntime;

use crate::api;
use crate::state::AppState;

/// Validate the configuration and wire a fully-built [`AppState`].
pub fn build_app_state(
    config: Arc<Config>,
    runtime: Arc<dyn InferenceRuntime>,
) -> anyhow::Result<AppState> {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let pool = Arc::new(Pool::new(runtime, PoolOptions::from_config(&config))?);
    Ok(AppState { config, pool })
}

/// Run the HTTP server until ctrl-c, then drain the pool.
pub async fn serve(config: Config, runtime: Arc<dyn InferenceRuntime>) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let state = build_app_state(config.clone(), runtime)?;
    let pool = state.pool.clone();
    let app = api::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "llamagate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.dispose().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received; draining");
}
