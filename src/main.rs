//! line-echo server binary
//!
//! Starts the server, runs until Ctrl-C, then stops it gracefully.

use line_echo::config::Config;
use line_echo::server::Server;
use tracing::info;
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
        max_message_len = config.max_message_len,
        read_buffer_size = config.read_buffer_size,
        "Starting line-echo server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(config).start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    server.stop().await;
    Ok(())
}
