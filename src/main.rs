//! llama-bridge - streams a persistent llama-cli conversation over WebSocket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use llama_bridge::config::{read_config_from_path, BridgeConfig};
use llama_bridge::server::start_server;
use llama_bridge::AppState;

#[derive(Parser, Debug)]
#[command(name = "llama-bridge")]
#[command(about = "WebSocket chat bridge for a persistent llama-cli process")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the llama-cli executable
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Path to the GGUF model file
    #[arg(long)]
    model: Option<PathBuf>,

    /// Serve the echo backend instead of llama-cli
    #[arg(long)]
    mock: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(executable) = &self.executable {
            config.process.executable = Some(executable.clone());
        }
        if let Some(model) = &self.model {
            config.process.model = Some(model.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    llama_bridge::init_tracing(args.debug);

    info!("Starting llama-bridge");

    let mut config = match &args.config {
        Some(path) => read_config_from_path(path)?,
        None => BridgeConfig::default(),
    };
    args.apply(&mut config);

    let state = if args.mock {
        AppState::mock(config)
    } else {
        AppState::new(config)
    };
    let state = Arc::new(state);

    // A missing executable or model is fatal before any connection is accepted
    state.start_backend().await?;

    let (addr, server) = start_server(
        state.clone(),
        &state.config.server.host,
        state.config.server.port,
    )
    .await?;

    info!(
        "Chat endpoint ws://{}/ws/chat ({} backend)",
        addr,
        state.backend_name()
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received, exiting");
        }
        _ = server => {
            tracing::error!("Server task exited");
        }
    }

    state.stop_backend().await;

    Ok(())
}
