//! Remote memory peer for the RDMA device.
//!
//! Each accepted connection is an independent session: the handshake sizes a zeroed in-memory
//! store, and subsequent READ/WRITE/ALLOCATE requests are served from it until CLOSE or EOF.
//!
//! [`shutdown_signal`] is shared with the `bscomp` binary.

#![forbid(unsafe_code)]

mod config;
mod server;
mod session;
mod signal;

pub use config::{PeerConfig, DEFAULT_CAPACITY};
pub use server::{start_server, ServerHandle};
pub use session::{Next, PeerSession};
pub use signal::shutdown_signal;
