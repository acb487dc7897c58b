use std::sync::Arc;

use yuksi_dispatch::auth::JwtKeys;
use yuksi_dispatch::config::Config;
use yuksi_dispatch::engine::queue::run_offer_engine;
use yuksi_dispatch::engine::sweeper::start_dispatch_sweeper;
use yuksi_dispatch::error::AppError;
use yuksi_dispatch::observability::init_tracing;
use yuksi_dispatch::realtime::start_route_sweeper;
use yuksi_dispatch::routing::SerpApiDirections;
use yuksi_dispatch::state::AppState;
use yuksi_dispatch::{api, store};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level, config.log_format);

    let store = store::init_store(&config).await?;
    if config.directions_api_key.is_none() {
        tracing::warn!("DIRECTIONS_API_KEY not set; route sockets will only receive route_error frames");
    }
    let directions = SerpApiDirections::new(
        &config.directions_base_url,
        config.directions_api_key.clone(),
        config.directions_timeout,
    )?;

    let (app_state, order_rx) = AppState::new(
        store,
        Arc::new(directions),
        JwtKeys::new(config.jwt_secret.clone()),
        config.dispatch.clone(),
        config.order_queue_size,
    );
    let shared_state = Arc::new(app_state);

    let app = api::rest::router(shared_state.clone());

    tokio::spawn(run_offer_engine(shared_state.clone(), order_rx));
    start_dispatch_sweeper(shared_state.offers.clone(), config.dispatch_sweep_interval);
    start_route_sweeper(shared_state.routes.clone(), config.route_sweep_interval);

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        storage = shared_state.store.backend(),
        "http server started"
    );

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
