use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sync_gateway::config::Config;
use sync_gateway::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;
    let presence_interval = Duration::from_secs(config.presence_interval_secs);

    // In-memory collaborators for local development. Production wires real
    // services here: document database, authorization engine, merge worker,
    // Redis counters, and the analytics warehouse.
    let state = AppState::in_memory(config);

    tracing::info!(port, "sync-gateway configured");

    // Periodic presence flush, cancelled cleanly at shutdown.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let presence_task = tokio::spawn(
        state
            .presence
            .clone()
            .run(presence_interval, shutdown_rx),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(sync_gateway::gateway::server::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "sync-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await
    .expect("server error");

    let _ = shutdown_tx.send(true);
    let _ = presence_task.await;
}
