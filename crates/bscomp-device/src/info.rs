use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Numeric device type identifier, shared with native artifacts through the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceType(pub u64);

impl DeviceType {
    pub const UNKNOWN: DeviceType = DeviceType(0);
    pub const STACK_CPU: DeviceType = DeviceType(2);
    pub const RAM: DeviceType = DeviceType((1 << 32) | 1);
    pub const RDMA: DeviceType = DeviceType((1 << 32) | 2);
    pub const MOTHERBOARD: DeviceType = DeviceType(1 << 48);

    pub fn name(self) -> &'static str {
        match self {
            DeviceType::STACK_CPU => "stack-cpu",
            DeviceType::RAM => "ram",
            DeviceType::RDMA => "rdma",
            DeviceType::MOTHERBOARD => "motherboard",
            _ => "unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#x})", self.name(), self.0)
    }
}

/// Static identity of a constructed device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Artifact path, builtin artifact name or remote endpoint.
    pub identity: String,
    pub device_type: DeviceType,
    pub device_id: u32,
}

impl DeviceInfo {
    /// Builds an identity record with a freshly allocated device id.
    pub fn new(identity: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            identity: identity.into(),
            device_type,
            device_id: next_device_id(),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} ({})",
            self.device_type.name(),
            self.device_id,
            self.identity
        )
    }
}

static NEXT_DEVICE_ID: AtomicU32 = AtomicU32::new(0);

/// Process-wide monotonically increasing device id.
pub fn next_device_id() -> u32 {
    NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed)
}
