use clap::Parser;
use log::error;
use master::network::{MasterConfig, MasterServer};
use shared::MASTER_PORT;
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, binds the directory socket and runs the
/// receive loop until interrupted.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Address to bind the UDP socket to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[clap(short, long, default_value_t = MASTER_PORT)]
        port: u16,
        /// Seconds between expiry sweeps
        #[clap(long, default_value = "30")]
        prune_interval_secs: u64,
        /// Seconds a server stays listed without an info refresh
        #[clap(long, default_value = "180")]
        server_expiry_secs: u64,
        /// Seconds a silent subscriber stays in the fan-out
        #[clap(long, default_value = "600")]
        subscriber_expiry_secs: u64,
        /// Permanent seed entry as host:port, repeatable
        #[clap(long = "seed")]
        seeds: Vec<String>,
    }

    env_logger::init();

    // Parse command line arguments
    let args = Args::parse();

    let config = MasterConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        prune_interval: Duration::from_secs(args.prune_interval_secs),
        server_expiry: Duration::from_secs(args.server_expiry_secs),
        subscriber_expiry: Duration::from_secs(args.subscriber_expiry_secs),
    };

    let mut server = MasterServer::new(config).await?;

    // Seed permanent entries before serving queries
    for seed in &args.seeds {
        match seed.rsplit_once(':').map(|(host, port)| (host, port.parse::<u16>())) {
            Some((host, Ok(port))) => server.add_seed(host, port).await,
            _ => error!("Ignoring malformed seed (expected host:port): {}", seed),
        }
    }

    let shutdown = server.shutdown_handle();

    // Spawn the run loop
    let server_handle = tokio::spawn(async move {
        server.run().await;
    });

    // Handle shutdown gracefully
    tokio::select! {
        result = server_handle => {
            if let Err(e) = result {
                eprintln!("Master task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
            shutdown.signal();
        }
    }

    Ok(())
}
