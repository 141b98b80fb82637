use std::time::Duration;

use anyhow::Context;
use segrun_orchestrator::{api, config::Config, service::job_service, state::AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound between two eviction sweeps
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "segrun_orchestrator=info,segrun_runner=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Segrun Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    match &config.inference_exe {
        Some(exe) if exe.is_file() => tracing::info!("Inference executable: {}", exe.display()),
        Some(exe) => tracing::warn!(
            "Inference executable {} does not exist; cases will fail to launch",
            exe.display()
        ),
        None => tracing::warn!(
            "No inference executable found; set SEGRUN_INFERENCE_EXE or NNUNET_CONDA_PREFIX"
        ),
    }
    tracing::info!("Work directory: {}", config.work_dir.display());

    let addr = config.bind_addr.clone();
    let state = AppState::from_config(config);

    spawn_eviction_sweeper(state.clone());

    // Build router with all API endpoints
    let app = api::create_router(state);

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Orchestrator stopped");
    Ok(())
}

/// Periodically drops finished jobs past the retention window
fn spawn_eviction_sweeper(state: AppState) {
    let period = state.config.job_retention.clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            job_service::evict_expired(&state.registry, &state.config).await;
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
