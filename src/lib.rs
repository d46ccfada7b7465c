//! bridgesim: a simulated computer assembled from pluggable devices on a shared bus.
//!
//! The crates of the workspace, re-exported under one roof:
//!
//! - [`device`]: the device contract every component implements.
//! - [`ram`]: the in-process RAM device (also shipped as a loadable native artifact).
//! - [`loader`]: builds devices from builtin or native artifacts.
//! - [`rdma`]: a device backed by memory on a remote peer.
//! - [`motherboard`]: the bus that owns devices, routes global addresses and drives lifecycle.

#![forbid(unsafe_code)]

pub use bscomp_device as device;
pub use bscomp_loader as loader;
pub use bscomp_motherboard as motherboard;
pub use bscomp_ram as ram;
pub use bscomp_rdma as rdma;

pub use bscomp_device::{BusAccess, ConfigBlob, Device, DeviceError, LifecycleState};
pub use bscomp_motherboard::{BusState, Coordinator, Motherboard};
