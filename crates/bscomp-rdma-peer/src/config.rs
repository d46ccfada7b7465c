use std::net::SocketAddr;

use bscomp_rdma_protocol::Limits;

/// Default capacity granted to a device that does not request one.
pub const DEFAULT_CAPACITY: u32 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub bind_addr: SocketAddr,
    /// Largest capacity a session may request; also granted when a device requests zero.
    pub capacity: u32,
    pub limits: Limits,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            capacity: DEFAULT_CAPACITY,
            limits: Limits::default(),
        }
    }
}
