use clap::Parser;
use log::{error, info};
use server::{Server, ServerConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Parses command-line arguments, then runs the server until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about = "LSNP rendezvous server")]
    struct Args {
        /// Ip address to bind to
        #[clap(short = 'H', long)]
        host: Option<IpAddr>,
        /// Port to listen on
        #[clap(short, long)]
        port: Option<u16>,
        /// TOML config file
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// Log every relayed datagram
        #[clap(short, long)]
        verbose: bool,
    }

    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.bind.set_ip(host);
    }
    if let Some(port) = args.port {
        config.bind.set_port(port);
    }

    let server = Arc::new(Server::bind(&config).await?);
    let server_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    server.shutdown();

    match server_handle.await {
        Ok(Err(e)) => error!("Server stopped with error: {}", e),
        Err(e) => error!("Server task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}
