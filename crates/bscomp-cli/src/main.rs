#![forbid(unsafe_code)]

mod config;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bscomp_device::{ConfigBlob, Device};
use bscomp_loader::Loader;
use bscomp_motherboard::{BusState, Coordinator, Motherboard, MotherboardConfig};
use bscomp_rdma::{RdmaConfig, RdmaDevice};
use bscomp_rdma_peer::shutdown_signal;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::Args;

/// Builds the computer: RAM, then the optional RDMA device, on a fresh motherboard.
fn assemble(args: &Args) -> Result<Motherboard> {
    let board = Motherboard::with_config(
        "motherboard",
        MotherboardConfig {
            max_devices: args.max_devices as usize,
        },
    )
    .context("constructing motherboard")?;

    let ram = Loader::new()
        .load(&args.ram_artifact, ConfigBlob::from_u32(args.ram_size))
        .with_context(|| format!("loading RAM artifact {}", args.ram_artifact))?;
    board.attach(Arc::from(ram)).context("attaching RAM")?;

    if let Some(endpoint) = &args.rdma {
        let settings = RdmaConfig {
            response_timeout: args.rdma_timeout(),
            ..RdmaConfig::default()
        };
        let rdma = RdmaDevice::connect_with(
            &endpoint.host,
            endpoint.port,
            ConfigBlob::from_u32(args.rdma_capacity),
            settings,
        )
        .with_context(|| format!("connecting RDMA device to {endpoint}"))?;
        board.attach(Arc::new(rdma)).context("attaching RDMA device")?;
    }

    Ok(board)
}

/// Halts the bus and waits for the boot thread to exit.
async fn halt(coordinator: Coordinator) -> Result<()> {
    tokio::task::spawn_blocking(move || coordinator.halt())
        .await?
        .context("bus reported an error while halting")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let halt_after = args.halt_after();

    // Polled from the first select on, so signals are caught during assembly and boot too.
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    // Construction dials the RDMA peer and must not block the runtime.
    let assembling = tokio::task::spawn_blocking(move || assemble(&args));
    let board = tokio::select! {
        board = assembling => board??,
        signal = &mut shutdown => {
            tracing::info!(signal, "shutdown signal received during assembly");
            return Ok(());
        }
    };
    tracing::info!(
        slots = board.num_slots(),
        filled = board.slots_filled(),
        mapped = board.size(),
        "computer assembled"
    );

    let coordinator = Coordinator::spawn(board.clone()).context("starting boot thread")?;
    let booting = {
        let board = board.clone();
        tokio::task::spawn_blocking(move || board.wait_booted())
    };
    let state = tokio::select! {
        state = booting => state?,
        signal = &mut shutdown => {
            tracing::info!(signal, "shutdown signal received during boot");
            return halt(coordinator).await;
        }
    };

    if state != BusState::Running {
        tokio::task::spawn_blocking(move || coordinator.join())
            .await?
            .context("boot failed")?;
        bail!("bus halted during boot");
    }

    match halt_after {
        Some(after) => {
            tokio::select! {
                _ = tokio::time::sleep(after) => tracing::info!("halt timer expired"),
                signal = &mut shutdown => tracing::info!(signal, "shutdown signal received"),
            }
        }
        None => {
            let signal = (&mut shutdown).await;
            tracing::info!(signal, "shutdown signal received");
        }
    }

    halt(coordinator).await
}
