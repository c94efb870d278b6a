use std::sync::Arc;

use courier_dispatch::api;
use courier_dispatch::config::Config;
use courier_dispatch::engine::dispatch::resume_dispatches;
use courier_dispatch::error::AppError;
use courier_dispatch::notify::LogNotifier;
use courier_dispatch::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let settings = config.dispatch_settings()?;
    tracing::info!(
        offer_ttl_secs = settings.offer_ttl.as_secs(),
        search_interval_secs = settings.search_interval.as_secs(),
        search_deadline_secs = settings.search_deadline.as_secs(),
        search_radius_km = settings.search_radius_km,
        "dispatch settings loaded"
    );

    let shared_state = Arc::new(AppState::new(
        settings,
        config.event_buffer_size,
        Arc::new(LogNotifier),
    ));

    let resumed = resume_dispatches(&shared_state);
    if resumed > 0 {
        tracing::info!(resumed, "resumed driver searches");
    }

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
