mod audit;
mod auth;
mod cli;
mod config;
mod reaper;
mod routes;
mod session;
mod state;
mod store;
mod trust;
mod websocket;

use axum::{routing::get, Router};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    state::AppState,
    websocket::{websocket_handler, RelayState},
};

#[tokio::main]
async fn main() {
    // Default to INFO if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Check if running as relay probe client
    if let Some(Commands::Probe {
        url,
        room,
        role,
        watch,
    }) = cli.command
    {
        if let Err(err) = cli::run_probe(url, room, role.into(), watch).await {
            error!("probe error: {}", err);
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as the broker
    let config = Config::from_env();
    info!("Starting Skylight broker on port {}", config.port);
    match &config.redis_url {
        Some(url) => info!("Session store: redis at {}", url),
        None => info!("Session store: in-memory"),
    }

    info!(
        expired_grace_seconds = config.expired_grace_seconds,
        ended_retention_seconds = config.ended_retention_seconds,
        audit_retention_days = config.audit_retention_days,
        "retention windows configured"
    );

    let state = match AppState::connect(config.clone()).await {
        Ok(state) => state,
        Err(err) => {
            error!("Failed to initialize session store: {}", err);
            std::process::exit(1);
        }
    };

    reaper::spawn(state.store.clone(), state.config.clone());

    let relay = RelayState::new(state.engine.clone());

    // Two routers with different states: management surface and relay
    let http_routes = routes::build_router(state);
    let ws_routes = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(relay);

    let app = Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("Skylight relay listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
