//! TunGo daemon CLI.
//!
//! Exit codes: 0 normal, 1 configuration or startup error, 2 runtime
//! fatal error.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use tungo_core::Server;
use tungo_core::config::encode_key;
use tungo_crypto::{StaticKeypair, fingerprint};
use tungo_transport::InMemoryTun;

/// TunGo - point-to-point IP VPN over TCP, UDP, or WebSocket.
#[derive(Parser)]
#[command(name = "tungo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server daemon.
    Serve {
        /// Serve against an in-memory loopback TUN. Creating a real OS
        /// device is platform glue that lives outside this daemon.
        #[arg(long)]
        loopback_tun: bool,
    },

    /// Generate a fresh identity key pair.
    Keygen,

    /// Validate a configuration file and print peer fingerprints.
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    let config_path = cli.config.unwrap_or_else(config::default_path);

    match cli.command {
        Commands::Keygen => {
            let keypair = StaticKeypair::generate();
            println!("private_key = \"{}\"", encode_key(&keypair.private_bytes()));
            println!("public_key  = \"{}\"", encode_key(&keypair.public_bytes()));
            println!("fingerprint = {}", fingerprint(&keypair.public_bytes()));
            ExitCode::SUCCESS
        }

        Commands::CheckConfig => match config::load_server(&config_path) {
            Ok(config) => {
                println!(
                    "ok: {} listener(s), {} peer(s)",
                    [
                        config.listeners.udp.is_some(),
                        config.listeners.tcp.is_some(),
                        config.listeners.ws.is_some(),
                    ]
                    .iter()
                    .filter(|enabled| **enabled)
                    .count(),
                    config.policy.records().len(),
                );
                println!("server fingerprint: {}", fingerprint(&config.keypair.public_bytes()));
                for record in config.policy.records() {
                    println!(
                        "peer {} internal={} enabled={}",
                        record.fingerprint(),
                        record.internal_addr,
                        record.enabled,
                    );
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{e:#}");
                ExitCode::from(1)
            }
        },

        Commands::Serve { loopback_tun } => {
            let config = match config::load_server(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    error!("{e:#}");
                    return ExitCode::from(1);
                }
            };

            if !loopback_tun {
                error!(
                    "no TUN backend: pass --loopback-tun, or integrate a platform TUN device"
                );
                return ExitCode::from(1);
            }
            warn!("serving with an in-memory loopback TUN; packets are not routed to the OS");
            let (tun, mut handle) = InMemoryTun::pair(config.limits.mtu, 256);
            // Echo everything the data plane delivers back into the TUN
            // read path, so tunnelled traffic round-trips.
            tokio::spawn(async move {
                while let Some(packet) = handle.written.recv().await {
                    if handle.inject.send(packet).await.is_err() {
                        break;
                    }
                }
            });

            let server = match Server::new(config, Arc::new(tun)) {
                Ok(server) => Arc::new(server),
                Err(e) => {
                    error!("startup failed: {e}");
                    return ExitCode::from(1);
                }
            };

            let listeners = match server.bind().await {
                Ok(listeners) => listeners,
                Err(e) => {
                    error!("startup failed: {e}");
                    return ExitCode::from(1);
                }
            };

            let shutdown = server.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; shutting down");
                    shutdown.cancel();
                }
            });

            match server.serve(listeners).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("runtime failure: {e}");
                    ExitCode::from(2)
                }
            }
        }
    }
}
