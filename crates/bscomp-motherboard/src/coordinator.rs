use std::io;
use std::thread::{self, JoinHandle};

use crate::{BusError, BusState, Motherboard};

const BOOT_THREAD_NAME: &str = "bscomp-boot";

pub(crate) fn spawn_boot(board: Motherboard) -> io::Result<JoinHandle<Result<(), BusError>>> {
    thread::Builder::new()
        .name(BOOT_THREAD_NAME.to_string())
        .spawn(move || board.boot())
}

pub(crate) fn join_boot(handle: JoinHandle<Result<(), BusError>>) -> Result<(), BusError> {
    handle.join().unwrap_or(Err(BusError::BootPanicked))
}

/// Runs a motherboard's boot loop on a dedicated thread.
///
/// The coordinator owns that thread: [`Coordinator::halt`] stops the bus and joins it, and
/// dropping a coordinator that was never halted does the same.
pub struct Coordinator {
    board: Motherboard,
    handle: Option<JoinHandle<Result<(), BusError>>>,
}

impl Coordinator {
    pub fn spawn(board: Motherboard) -> Result<Self, BusError> {
        let handle = spawn_boot(board.clone())?;
        tracing::debug!("boot thread spawned");
        Ok(Self {
            board,
            handle: Some(handle),
        })
    }

    pub fn board(&self) -> &Motherboard {
        &self.board
    }

    /// Waits for boot to finish and returns the resulting bus state: `Running` on success.
    pub fn wait_booted(&self) -> BusState {
        self.board.wait_booted()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Halts the bus, waits for the boot thread to exit and returns its outcome.
    pub fn halt(mut self) -> Result<(), BusError> {
        self.shutdown()
    }

    /// Waits for the boot thread to exit on its own, e.g. after a failed boot.
    pub fn join(mut self) -> Result<(), BusError> {
        match self.handle.take() {
            Some(handle) => join_boot(handle),
            None => Ok(()),
        }
    }

    fn shutdown(&mut self) -> Result<(), BusError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        tracing::info!("halting bus");
        self.board.halt();
        let result = join_boot(handle);
        tracing::info!(state = %self.board.bus_state(), "boot thread exited");
        result
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!("boot ended with error: {err}");
        }
    }
}
