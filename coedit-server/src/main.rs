use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use coedit_server::{ServerConfig, ServerState, config::Environment, server};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Args {
    /// Listen port, overrides PORT.
    #[clap(short, long)]
    port: Option<u16>,
    /// Document storage directory, overrides STORE_URI.
    #[clap(short, long)]
    storage: Option<PathBuf>,
    /// Redis URL for the fan-out bus, overrides BUS_URL.
    #[clap(short, long)]
    bus: Option<String>,
}

#[tokio::main]
async fn main() {
    let mut config = ServerConfig::from_env().expect("Loading configuration");
    let args = Args::parse();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(storage) = args.storage {
        config.store_uri = storage;
    }
    if let Some(bus) = args.bus {
        config.bus_url = Some(bus);
    }

    let default_level = match config.node_env {
        Environment::Development => "debug",
        Environment::Production => "info",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}={default_level},tower_http={default_level}",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = ServerState::new(config)
        .await
        .expect("Init server state");

    info!("Starting server on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Unable to bind to host");
    axum::serve(
        listener,
        server(state).layer(TraceLayer::new_for_http()),
    )
    .with_graceful_shutdown(async { tokio::signal::ctrl_c().await.expect("Listen to ctrlc") })
    .await
    .unwrap();

    info!("Server has shut down");
}
