//! Byte-addressable RAM device.
//!
//! The configuration's primary field is the memory size in bytes. Memory is allocated at
//! construction, zero-filled, and released when the device stops.

pub mod ffi;

use std::sync::Mutex;

use bscomp_device::{
    check_range, lock, ConfigBlob, ConstructionError, Device, DeviceError, DeviceInfo, DeviceType,
    LifecycleState, StartError,
};

/// Name under which the RAM device is registered as a builtin artifact.
pub const RAM_ARTIFACT: &str = "bscomp-ram";

pub struct RamDevice {
    info: DeviceInfo,
    config: ConfigBlob,
    size: u64,
    inner: Mutex<RamInner>,
}

struct RamInner {
    state: LifecycleState,
    memory: Vec<u8>,
}

impl RamDevice {
    pub fn new(identity: impl Into<String>, config: ConfigBlob) -> Result<Self, ConstructionError> {
        let record = config.decode()?;
        let size = record.primary().unwrap_or(0);
        if size == 0 {
            return Err(ConstructionError::ConstructionRejected(
                "RAM size must be non-zero".to_string(),
            ));
        }

        let mut memory = Vec::new();
        memory.try_reserve_exact(size as usize).map_err(|_| {
            ConstructionError::ConstructionRejected(format!("cannot allocate {size} bytes of RAM"))
        })?;
        memory.resize(size as usize, 0);

        let info = DeviceInfo::new(identity, DeviceType::RAM);
        tracing::debug!(device = %info, size, "constructed RAM device");

        Ok(Self {
            info,
            config,
            size: u64::from(size),
            inner: Mutex::new(RamInner {
                state: LifecycleState::Constructed,
                memory,
            }),
        })
    }

    /// Convenience constructor using a baseline configuration blob.
    pub fn with_size(size: u32) -> Result<Self, ConstructionError> {
        Self::new(RAM_ARTIFACT, ConfigBlob::from_u32(size))
    }
}

impl Device for RamDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn config(&self) -> &ConfigBlob {
        &self.config
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn state(&self) -> LifecycleState {
        lock(&self.inner).state
    }

    fn start(&self) -> Result<(), StartError> {
        let mut inner = lock(&self.inner);
        inner.state.check_start()?;
        inner.state = LifecycleState::Running;
        Ok(())
    }

    fn stop(&self) {
        let mut inner = lock(&self.inner);
        if inner.state.is_halted() {
            return;
        }
        inner.state = LifecycleState::Halted;
        inner.memory = Vec::new();
        tracing::debug!(device = %self.info, "RAM device halted");
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        let inner = lock(&self.inner);
        inner.state.ensure_running()?;
        let start = check_range(offset, len, self.size)?;
        Ok(inner.memory[start..start + len].to_vec())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mut inner = lock(&self.inner);
        inner.state.ensure_running()?;
        let start = check_range(offset, data.len(), self.size)?;
        inner.memory[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}
