use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sea_orm_migration::MigratorTrait;
use zapline_control::bot_store::SeaBotStore;
use zapline_control::state::AppState;
use zapline_supervisor::{Supervisor, SupervisorConfig};

async fn init_state() -> anyhow::Result<AppState> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;
    let db = zapline_db::connect(&database_url)
        .await
        .context("connect database")?;

    // Idempotent; runs on every boot.
    zapline_migration::Migrator::up(&db, None)
        .await
        .context("apply migrations")?;

    let store = Arc::new(SeaBotStore::new(Arc::new(db)));
    let config = SupervisorConfig::from_env();
    tracing::info!(
        base_port = config.base_port,
        worker = %config.worker_command,
        data_root = %config.data_root.display(),
        "supervisor configured"
    );
    let supervisor = Supervisor::new(config, store.clone())?;

    Ok(AppState { store, supervisor })
}

fn listen_addr() -> SocketAddr {
    std::env::var("ZAPLINE_LISTEN")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| ([0, 0, 0, 0], 5000).into())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let state = init_state().await?;
    let supervisor = state.supervisor.clone();
    let app = zapline_control::app(state);

    let addr = listen_addr();
    tracing::info!(%addr, "zapline-control HTTP listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("stopping bot instances");
    supervisor.cleanup_all().await;
    Ok(())
}
