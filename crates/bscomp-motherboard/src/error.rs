use bscomp_device::StartError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("the bus has already started booting")]
    AlreadyBooting,

    #[error("all {max_devices} slots are occupied")]
    BusFull { max_devices: usize },

    #[error("the bus has halted")]
    Halted,

    #[error("device in slot {slot} ({identity}) failed to start: {source}")]
    BootFailed {
        slot: usize,
        identity: String,
        #[source]
        source: StartError,
    },

    #[error("failed to spawn the boot thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("the boot thread panicked")]
    BootPanicked,
}
