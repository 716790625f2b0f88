//! xread server
//!
//! Serves block reads of files under a root directory over TCP.
//!
//! Usage:
//!     cargo build --release -p xread-server-bin
//!     ./target/release/xread-server [config.toml] [--listen ADDR] [--root DIR] [--portals N]
//!     ./target/release/xread-server --print-config > xread.toml
//!
//! Logging follows `[logging] level` unless `RUST_LOG` is set.

use xread_server::config::SAMPLE_CONFIG;
use xread_server::{logging, Server, ServerConfig};

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "xread-server")]
#[command(about = "Remote block-read server")]
struct Args {
    /// Config file path (optional, CLI args override config)
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Directory object names resolve against
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Number of portal threads
    #[arg(short, long)]
    portals: Option<usize>,

    /// Print a sample configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if args.print_config {
        print!("{}", SAMPLE_CONFIG);
        return ExitCode::SUCCESS;
    }

    let mut config = match &args.config {
        Some(path) => match ServerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("xread-server: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(root) = args.root {
        config.root_dir = root;
    }
    if let Some(portals) = args.portals {
        config.portals = portals;
    }

    logging::init(&config.logging);

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("second signal, exiting immediately");
            std::process::exit(1);
        }
        tracing::info!("shutdown signal received, draining");
    }) {
        tracing::error!(error = %e, "failed to install signal handler");
        return ExitCode::FAILURE;
    }

    let backend = match config.build_backend() {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(error = %e, kind = ?config.backend.kind, "failed to create file backend");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::start(&config, backend) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            return ExitCode::FAILURE;
        }
    };

    server.wait_for_shutdown(&shutdown);
    ExitCode::SUCCESS
}
