//! The motherboard bus.
//!
//! A [`Motherboard`] owns an ordered set of device slots. Booting starts the devices in slot order
//! and then serves bus requests, translating global bus addresses through an [`AddressMap`] into
//! device-local offsets. Halting stops the request loop and every device, in reverse slot order.
//! [`Coordinator`] runs the boot loop on its own thread so the host can wait for a halt signal.

mod address_map;
mod bus;
mod client;
mod config;
mod coordinator;
mod error;

pub use address_map::{AddressMap, Window};
pub use bus::{BusState, Motherboard};
pub use client::BusClient;
pub use config::{MotherboardConfig, DEFAULT_MAX_DEVICES};
pub use coordinator::Coordinator;
pub use error::BusError;
