//! wsecho: A WebSocket JSON echo server
//!
//! Speaks the WebSocket protocol directly over TCP:
//! - HTTP/1.1 upgrade handshake with `Sec-WebSocket-Accept` derivation
//! - Masked client frame decoding and unmasked server frame encoding
//! - Payloads up to 65535 bytes (7-bit and 16-bit length forms)
//!
//! Each JSON message is echoed back wrapped in a timestamped envelope.
//! Configuration via CLI arguments or TOML file.

mod config;
mod http;
mod protocols;
mod server;

use config::Config;
use protocols::echo::EchoHandler;
use server::Server;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = config.max_connections,
        max_header_size = config.max_header_size,
        trace_unmask = config.trace_unmask,
        "Starting wsecho server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers.filter(|&w| w > 0) {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    let server = Server::new(config, Arc::new(EchoHandler::new()));
    runtime.block_on(server.run())
}
