//! carbon_usage server
//!
//! Serves the carbon usage REST API over Axum with Sled persistence.
//!
//! Usage:
//!   cargo run --bin load_data        # seed the usage type catalog
//!   cargo run --bin carbon_usage     # start server (CARBON_PORT, default 8000)

use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;

use carbon_usage::config::Settings;
use carbon_usage::rest::create_router;
use carbon_usage::storage::Storage;
use carbon_usage::telemetry;

#[derive(Parser)]
#[command(name = "carbon_usage", about = "Carbon usage tracking API server")]
struct Args {
    /// Port to listen on (overrides CARBON_PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Sled database directory (overrides CARBON_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut settings = Settings::from_env()?;
    if let Some(port) = args.port {
        settings.bind_addr.set_port(port);
    }
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }

    let _log_guard = telemetry::init(&settings.log);

    let storage = Storage::open(&settings.data_dir)?;
    let addr = settings.bind_addr;
    tracing::info!(%addr, data_dir = %settings.data_dir.display(), "carbon_usage starting");

    let app = create_router(storage.clone(), settings);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    storage.flush().await?;
    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
}
