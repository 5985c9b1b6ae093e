//! packetlog: a shared packet log over TCP
//!
//! Clients send newline-terminated packets. Every complete packet is
//! appended to one log shared by all connections, and the whole log is then
//! sent back to the client that sent it.
//!
//! Features:
//! - One task per connection, packets reassembled across reads
//! - Serialized appends, so entries from different clients never interleave
//! - Optional daemon mode
//! - Graceful shutdown on SIGINT/SIGTERM, removing the log file
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod framer;
mod lifecycle;
mod log_store;
mod server;

use config::Config;
use lifecycle::ShutdownSignals;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config)?;

    info!(
        listen = config.listen.as_deref().unwrap_or("*"),
        port = config.port,
        log_path = %config.log_path.display(),
        daemon = config.daemon,
        "Starting packetlog server"
    );

    // Hold SIGINT/SIGTERM until their handlers exist, so a signal arriving
    // between creating the log file and entering the runtime still leads to
    // a clean shutdown instead of the default kill.
    let blocked = lifecycle::block_shutdown_signals()?;

    // Bind before forking so startup errors reach the invoking shell.
    let server = Server::bind(&config).inspect_err(|e| error!(error = %e, "Startup failed"))?;
    info!(address = %server.local_addr(), "Listening socket ready");

    if config.daemon {
        lifecycle::daemonize()?;
        info!(pid = std::process::id(), "Running as daemon");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let signals = {
        let _guard = runtime.enter();
        ShutdownSignals::install()?
    };
    // Any signal held back so far is delivered now, to the handlers above.
    blocked.restore()?;

    runtime.block_on(async {
        server.run_until(signals.wait()).await?;
        info!("Server stopped");
        Ok::<_, Box<dyn std::error::Error>>(())
    })?;

    // Don't wait on connections stuck in blocking reads or writes.
    runtime.shutdown_background();
    Ok(())
}

fn init_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_file {
        Some(ref path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }
    Ok(())
}
