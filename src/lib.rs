//! llama-bridge - WebSocket chat over a persistent llama-cli process
//!
//! A single llama-cli process holds the conversation and its KV cache. Clients
//! connect to `/ws/chat`, send one text frame per user turn, and receive the
//! model output as a stream of text frames closed by `[[END_OF_RESPONSE]]`.
//! Turns from every connection are serialized against the one process.

pub mod bridge;
pub mod config;
pub mod mock;
pub mod process;
pub mod server;
pub mod session;

mod error;
mod state;
mod utils;

pub use error::{Error, Result};
pub use session::{SessionEnd, StreamingSession, END_OF_RESPONSE};
pub use state::AppState;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` is honoured as given. Without it the crate logs at info;
/// `debug` raises the crate to debug either way.
pub fn init_tracing(debug: bool) {
    let filter = log_filter(EnvFilter::try_from_default_env().ok(), debug);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn log_filter(from_env: Option<EnvFilter>, debug: bool) -> EnvFilter {
    match from_env {
        Some(filter) if !debug => filter,
        Some(filter) => with_crate_level(filter, "debug"),
        None => with_crate_level(EnvFilter::new("warn"), if debug { "debug" } else { "info" }),
    }
}

fn with_crate_level(filter: EnvFilter, level: &str) -> EnvFilter {
    match format!("llama_bridge={}", level).parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}
