use framed_rpc::config::Config;
use framed_rpc::rpc::Router;
use framed_rpc::runtime::Server;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }

    info!(
        listen = %config.listen,
        max_frame_size = config.max_frame_size,
        max_queue_depth = config.max_queue_depth,
        idle_timeout = config.idle_timeout,
        "Starting framed-rpc server"
    );

    let server = Server::bind(&config)?;

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("Received interrupt");
        if let Err(e) = shutdown.shutdown() {
            warn!(error = %e, "Failed to wake event loop");
        }
    })?;

    server.run(&Router::new())?;
    Ok(())
}
