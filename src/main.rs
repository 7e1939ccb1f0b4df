/// wkf-emulator server
///
/// Serves the emulated workflow backend over HTTP and WebSocket:
/// - Record API at /api/workflows/*
/// - Worker socket at /api/workflow/ws?db=<name>
/// - Health check at /healthz

use wkf_emulator::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3001 and data/emulator.db)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
