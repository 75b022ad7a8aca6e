use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};

use hsu_name_server::{NameServer, NameServerConfig, ServerState};

/// HSU Name Server - service registry broker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Request/reply bind address, e.g. tcp://*:5555 (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    request: Option<String>,

    /// Event publish bind address, e.g. tcp://*:5556 (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    publish: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Run duration in seconds (for testing)
    #[arg(long)]
    run_duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => NameServerConfig::load_from_file(path)?,
        None => NameServerConfig::default(),
    };

    // Command line overrides
    if let Some(request) = args.request.clone() {
        config.name_server.request_address = request;
    }
    if let Some(publish) = args.publish.clone() {
        config.name_server.publish_address = Some(publish);
    }
    config.validate()?;

    initialize_logging(args.debug, &config.name_server.log_level)?;

    info!("Starting HSU Name Server");
    if let Some(path) = &args.config {
        info!("Config file: {}", path);
    }

    let server = NameServer::new(config.server_options());
    if let Err(e) = server.start(
        &config.name_server.request_address,
        config.name_server.publish_address.as_deref(),
    ) {
        error!("Failed to start name server: {}", e);
        return Err(anyhow::anyhow!("Start failed: {}", e));
    }

    if let Some(address) = server.request_address() {
        info!("Serving requests on {}", address);
    }
    if let Some(address) = server.publish_address() {
        info!("Publishing events on {}", address);
    }

    // Wait for a signal, the run duration, or a wire SHUTDOWN
    match args.run_duration {
        Some(duration) => {
            info!("Running for {} seconds (test mode)", duration);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(duration)) => {}
                _ = wait_for_self_stop(&server) => {}
            }
        }
        None => {
            tokio::select! {
                _ = setup_signal_handlers() => {}
                _ = wait_for_self_stop(&server) => {}
            }
        }
    }

    info!("Shutting down name server...");
    tokio::task::block_in_place(|| server.stop());

    if let Some(e) = server.last_error() {
        error!("Name server stopped with error: {}", e);
        return Err(anyhow::anyhow!("Name server failed: {}", e));
    }

    info!("Name server shut down successfully");
    Ok(())
}

fn initialize_logging(debug: bool, configured_level: &str) -> Result<()> {
    let level = if debug { "debug" } else { configured_level };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    Ok(())
}

/// Resolves once the server stopped on its own (wire SHUTDOWN or a fatal
/// transport error).
async fn wait_for_self_stop(server: &NameServer) {
    let mut interval = tokio::time::interval(Duration::from_millis(200));
    loop {
        interval.tick().await;
        if server.state() == ServerState::Stopped {
            info!("Name server stopped by itself");
            return;
        }
    }
}

async fn setup_signal_handlers() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to create SIGTERM handler: {}", e);
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to create SIGINT handler: {}", e);
                let _ = sigterm.recv().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT signal");
            }
        }
    }

    #[cfg(windows)]
    {
        let _ = signal::ctrl_c().await;
        info!("Received Ctrl+C signal");
    }
}
