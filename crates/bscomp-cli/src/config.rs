use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bscomp_motherboard::DEFAULT_MAX_DEVICES;
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "bscomp", version, about = "Assemble, boot and run a bscomp computer")]
pub struct Args {
    /// RAM artifact: a builtin name or a path to a native device library.
    #[arg(long, env = "BSCOMP_RAM_ARTIFACT", default_value = "bscomp-ram")]
    pub ram_artifact: String,

    /// RAM size in bytes.
    #[arg(long, env = "BSCOMP_RAM_SIZE", default_value_t = 4 * 1024)]
    pub ram_size: u32,

    /// Remote memory peer to attach as an RDMA device (`host:port`).
    #[arg(long, env = "BSCOMP_RDMA_ENDPOINT")]
    pub rdma: Option<Endpoint>,

    /// Capacity in bytes to request from the RDMA peer; 0 accepts the peer's default.
    #[arg(long, env = "BSCOMP_RDMA_CAPACITY", default_value_t = 0, requires = "rdma")]
    pub rdma_capacity: u32,

    /// How long an RDMA request may wait for its response, in milliseconds.
    #[arg(long, env = "BSCOMP_RDMA_TIMEOUT_MS", default_value_t = 5_000)]
    pub rdma_timeout_ms: u64,

    /// Number of motherboard slots.
    #[arg(long, env = "BSCOMP_MAX_DEVICES", default_value_t = DEFAULT_MAX_DEVICES as u32)]
    pub max_devices: u32,

    /// Halt automatically after this many milliseconds instead of waiting for a signal.
    #[arg(long, env = "BSCOMP_HALT_AFTER_MS")]
    pub halt_after_ms: Option<u64>,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    #[arg(long, env = "BSCOMP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn rdma_timeout(&self) -> Duration {
        Duration::from_millis(self.rdma_timeout_ms)
    }

    pub fn halt_after(&self) -> Option<Duration> {
        self.halt_after_ms.map(Duration::from_millis)
    }
}

/// `host:port` of a remote memory peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {s:?}"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("missing host in {s:?}"));
        }
        let port = port
            .parse()
            .map_err(|_| format!("invalid port {port:?} in {s:?}"))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
