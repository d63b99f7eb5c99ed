mod cli;
mod config;
mod handlers;
mod presence;
mod protocol;
mod proxy;
mod registry;
mod session;
mod websocket;

use std::net::SocketAddr;

use axum::{routing::get, Router};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    handlers::{health_check, list_devices},
    websocket::{websocket_handler, RelayState},
};

#[tokio::main]
async fn main() {
    // Default to INFO unless the environment says otherwise.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Check if running as debug client
    if let Some(Commands::Debug { url, command }) = cli.command {
        if let Err(err) = cli::run_debug_client(url, command).await {
            error!("debug client error: {err}");
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as server
    let config = Config::from_env();
    info!("starting pier relay on port {}", config.port);
    info!(
        "stale threshold {}s, sweep interval {}s",
        config.stale_threshold.as_secs(),
        config.sweep_interval.as_secs()
    );

    let state = RelayState::new(config.clone());
    presence::spawn_sweeper(state.clone());

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/devices", get(list_devices))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    info!("pier relay listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("failed to start server");
}
