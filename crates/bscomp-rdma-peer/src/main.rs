#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bscomp_rdma_peer::{shutdown_signal, start_server, PeerConfig, DEFAULT_CAPACITY};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bscomp-rdma-peer", version, about = "Remote memory peer for bscomp RDMA devices")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "BSCOMP_RDMA_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen_addr: SocketAddr,

    /// Largest capacity in bytes a device may request; granted when a device requests zero.
    #[arg(long, env = "BSCOMP_RDMA_CAPACITY", default_value_t = DEFAULT_CAPACITY)]
    capacity: u32,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    #[arg(long, env = "BSCOMP_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> PeerConfig {
        PeerConfig {
            bind_addr: self.listen_addr,
            capacity: self.capacity,
            ..PeerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let handle = start_server(args.into_config()).await?;
    tracing::info!("bscomp-rdma-peer listening on {}", handle.local_addr());

    let signal = shutdown_signal().await;
    tracing::info!(signal, "shutdown signal received");
    handle.shutdown().await;
    Ok(())
}
