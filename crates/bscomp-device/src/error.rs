use thiserror::Error;

/// Failure to build a device's backing resources.
///
/// Construction errors are always fatal for the device being built and surface to the host before
/// any device runs.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("artifact not found: {path}: {reason}")]
    ArtifactNotFound { path: String, reason: String },

    #[error("artifact {path} does not export `{symbol}`")]
    SymbolMissing { path: String, symbol: String },

    #[error("device rejected its configuration: {0}")]
    ConstructionRejected(String),

    #[error("invalid configuration blob: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("cannot resolve endpoint {endpoint}")]
    Unresolvable { endpoint: String },

    #[error("connection to {endpoint} refused")]
    ConnectionRefused { endpoint: String },

    #[error("connection to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("io error while constructing device: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to bring a device from `Constructed` to `Running`.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("device is already running")]
    AlreadyRunning,

    #[error("device has halted and cannot be restarted")]
    Halted,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("device failed to start: {0}")]
    Device(String),
}

/// Errors returned by bus-level operations on a running device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device is not running")]
    NotRunning,

    #[error("address out of range: offset=0x{offset:x} len={len}")]
    AddressOutOfRange { offset: u64, len: usize },

    #[error("connection lost")]
    ConnectionLost,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("operation aborted")]
    Aborted,

    #[error("operation not supported by this device")]
    Unsupported,

    #[error("no device attached in slot {slot}")]
    NoSuchSlot { slot: usize },

    #[error("device reported failure code {0}")]
    Failed(i32),
}

/// Errors decoding a configuration blob.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("configuration blob has unexpected length {len}")]
    BadLength { len: usize },

    #[error("unsupported configuration version {version}")]
    UnsupportedVersion { version: u8 },

    #[error("configuration declares {declared} fields but carries {actual}")]
    FieldCountMismatch { declared: usize, actual: usize },

    #[error("configuration reserved bytes must be zero")]
    NonZeroReserved,
}
