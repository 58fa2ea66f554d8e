//! flashhttp - A High-Performance HTTP/1.x Static File Server
//!
//! This is the main entry point for the flashhttp server. It wires the
//! transport, serve loop, and static file handler together.

use flashhttp::fs::{FileServer, FileServerOptions};
use flashhttp::server::{ServeConfig, ServerOptions, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Server configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Directory to serve
    root: PathBuf,
    /// Generate listings for directories without an index file
    listings: bool,
    /// Serve pre-compressed sibling files to gzip clients
    compress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            root: PathBuf::from("."),
            listings: false,
            compress: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    if i + 1 < args.len() {
                        config.host = args[i + 1].clone();
                        i += 2;
                    } else {
                        eprintln!("Error: --host requires a value");
                        std::process::exit(1);
                    }
                }
                "--port" | "-p" => {
                    if i + 1 < args.len() {
                        config.port = args[i + 1].parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid port number");
                            std::process::exit(1);
                        });
                        i += 2;
                    } else {
                        eprintln!("Error: --port requires a value");
                        std::process::exit(1);
                    }
                }
                "--root" | "-r" => {
                    if i + 1 < args.len() {
                        config.root = PathBuf::from(&args[i + 1]);
                        i += 2;
                    } else {
                        eprintln!("Error: --root requires a value");
                        std::process::exit(1);
                    }
                }
                "--listings" => {
                    config.listings = true;
                    i += 1;
                }
                "--compress" => {
                    config.compress = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("flashhttp version {}", flashhttp::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn print_help() {
    println!(
        r#"
flashhttp - A High-Performance HTTP/1.x Static File Server

USAGE:
    flashhttp [OPTIONS]

OPTIONS:
    -h, --host <HOST>    Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>    Port to listen on (default: 8080)
    -r, --root <DIR>     Directory to serve (default: current directory)
        --listings       Generate listings for directories without an index
        --compress       Serve pre-compressed .flashhttp.gz siblings
    -v, --version        Print version information
        --help           Print this help message

EXAMPLES:
    flashhttp                          # Serve . on 127.0.0.1:8080
    flashhttp --root ./public          # Serve ./public
    flashhttp --host 0.0.0.0 -p 80     # Listen on all interfaces
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!(
        root = %config.root.display(),
        addr = %config.bind_address(),
        "Starting flashhttp v{}",
        flashhttp::VERSION
    );

    // The static file handler, shared across all connections
    let mut fs_options = FileServerOptions::new(config.root.clone());
    fs_options.generate_index_pages = config.listings;
    fs_options.compress = config.compress;
    let handler = Arc::new(FileServer::new(fs_options));

    let transport = Arc::new(Transport::new(ServerOptions {
        addr: config.bind_address(),
        serve: ServeConfig::default(),
        ..Default::default()
    }));
    transport.listen().await?;

    // Set up graceful shutdown
    let shutdown_transport = Arc::clone(&transport);
    let shutdown = async move {
        if signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Shutdown signal received, stopping server...");
        shutdown_transport.shutdown(Duration::from_secs(5)).await;
    };

    tokio::select! {
        result = transport.serve(handler) => { result?; }
        _ = shutdown => {}
    }

    info!("Server shutdown complete");
    Ok(())
}
