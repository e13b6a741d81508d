//! Resident Server - HTTP API for the resident-model orchestrator

use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use resident_core::{Orchestrator, OrchestratorConfig};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "resident_server=debug,resident_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Resident Server");

    let config = load_config()?;
    info!("History directory: {:?}", config.history_dir);
    info!(
        "Accelerator slots: {}, backends: {}",
        config.accelerator_slots,
        config
            .enabled_backends()
            .map(|(kind, _)| kind.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let orchestrator = Orchestrator::from_config(config)?;
    let state = AppState::new(orchestrator);

    // Build router
    let app = api::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.orchestrator.shutdown().await;
    info!("Server stopped");

    Ok(())
}

/// TOML file from `--config <path>` or `RESIDENT_CONFIG`, then `RESIDENT__*`
/// environment overrides (`RESIDENT__SERVER__PORT=9000`).
fn load_config() -> anyhow::Result<OrchestratorConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = config_path() {
        info!("Loading configuration from {}", path.display());
        builder = builder.add_source(config::File::from(path.as_path()).required(true));
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix("RESIDENT")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: OrchestratorConfig = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var_os("RESIDENT_CONFIG").map(PathBuf::from)
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}
