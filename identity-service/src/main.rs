use std::net::SocketAddr;
use std::sync::Arc;

use service_core::error::AppError;

use identity_service::config::IdentityConfig;
use identity_service::services::InMemorySessionIssuer;
use identity_service::{build_router, cleanup, db, AppState};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();

    let config = IdentityConfig::from_env()?;
    service_core::observability::logging::init_tracing(&config.service_name, &config.log_level);

    let pool = db::create_pool(&config.database)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;

    // The session issuer is the seam to the owning platform; the process
    // ships with a process-local one.
    let sessions = Arc::new(InMemorySessionIssuer::new(chrono::Duration::hours(24)));
    let state = AppState::new(config.clone(), pool, sessions);

    tokio::spawn(cleanup::run_reaper(
        state.store.clone(),
        config.cleanup_settings(),
    ));

    let app = build_router(state);
    let listener =
        tokio::net::TcpListener::bind((config.common.host.as_str(), config.common.port)).await?;
    let addr: SocketAddr = listener.local_addr()?;
    tracing::info!(service = %config.service_name, %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
