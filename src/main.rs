//! revmsg: a JSON payload listener
//!
//! Accepts HTTP-shaped requests over plain TCP, decodes the JSON object in
//! the request body, logs it, and answers every request with the same
//! `200 OK` response.
//!
//! Features:
//! - One task per connection, capped by a connection limit
//! - Bounded single-read requests with read/write deadlines
//! - Transient accept errors retried with backoff
//! - Configuration via CLI arguments or TOML file

mod config;
mod observer;
mod protocol;
mod server;

use std::sync::Arc;

use config::Config;
use observer::TracingObserver;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        read_timeout_ms = config.read_timeout.as_millis() as u64,
        write_timeout_ms = config.write_timeout.as_millis() as u64,
        workers = ?config.workers,
        "Starting revmsg"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async {
        let server = Server::bind(&config, Arc::new(TracingObserver)).inspect_err(|e| {
            error!(error = %e, "Failed to start listener");
        })?;
        server.run().await
    })?;

    Ok(())
}
