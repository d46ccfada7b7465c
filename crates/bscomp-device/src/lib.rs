//! Device contract for the bridgesim computer.
//!
//! Every device, whether it lives in-process, in a loaded native artifact or behind a network
//! connection, is driven through the [`Device`] trait. A device is constructed with an immutable
//! [`ConfigBlob`], started once, serves bus-level memory operations while running and is stopped
//! exactly once into the terminal [`LifecycleState::Halted`].

pub mod abi;
mod config;
mod error;
mod info;
mod lifecycle;

use std::sync::Arc;

pub use config::{ConfigBlob, ConfigRecord, CONFIG_MAGIC, CONFIG_VERSION};
pub use error::{ConfigError, ConstructionError, DeviceError, StartError};
pub use info::{next_device_id, DeviceInfo, DeviceType};
pub use lifecycle::{lock, LifecycleState};

/// Access to the bus a device is attached to.
///
/// Handed to a device when it is attached to a motherboard. Calls are routed through the bus's
/// request loop, so a device must only use this handle from its own execution context and never
/// from inside its `read`/`write`/`interrupt` handlers.
pub trait BusAccess: Send + Sync {
    /// Reads `len` bytes at global bus address `addr`.
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, DeviceError>;

    /// Writes `data` at global bus address `addr`.
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), DeviceError>;

    /// Delivers `code` to the device attached in `slot`.
    fn send_interrupt(&self, slot: usize, code: u32) -> Result<(), DeviceError>;
}

/// The capability every device implements.
///
/// Implementations serialize their own state transitions: `start`, `stop` and the bus operations
/// may be called from different threads.
pub trait Device: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    /// Configuration the device was constructed with.
    fn config(&self) -> &ConfigBlob;

    /// Size in bytes of the memory window this device exports onto the bus.
    ///
    /// Devices exporting nothing return `0` and occupy no bus addresses.
    fn size(&self) -> u64;

    fn state(&self) -> LifecycleState;

    /// `Constructed → Running`.
    fn start(&self) -> Result<(), StartError>;

    /// Moves the device to `Halted` and releases its resources.
    ///
    /// Must succeed from any state and be a no-op once halted.
    fn stop(&self);

    /// Reads `len` bytes at device-local `offset`.
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError>;

    /// Writes `data` at device-local `offset`.
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    fn interrupt(&self, _code: u32) -> Result<(), DeviceError> {
        self.state().ensure_running()?;
        Err(DeviceError::Unsupported)
    }

    /// Called once when the device is attached to a bus.
    fn connect_bus(&self, _bus: Arc<dyn BusAccess>) {}
}

/// Validates that `[offset, offset + len)` lies within a window of `size` bytes.
///
/// Returns the start offset as `usize` on success.
pub fn check_range(offset: u64, len: usize, size: u64) -> Result<usize, DeviceError> {
    let out_of_range = DeviceError::AddressOutOfRange { offset, len };
    let end = offset.checked_add(len as u64).ok_or(out_of_range.clone())?;
    if end > size {
        return Err(out_of_range);
    }
    usize::try_from(offset).map_err(|_| out_of_range)
}
