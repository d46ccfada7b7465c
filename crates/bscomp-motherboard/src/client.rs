use std::sync::mpsc;
use std::sync::Weak;

use bscomp_device::{lock, BusAccess, DeviceError};

use crate::bus::{Board, BusState};

pub(crate) enum BusRequest {
    Read { addr: u64, len: usize },
    Write { addr: u64, data: Vec<u8> },
    Interrupt { slot: usize, code: u32 },
}

pub(crate) enum BusMessage {
    Request {
        request: BusRequest,
        reply: mpsc::Sender<Result<Vec<u8>, DeviceError>>,
    },
    /// Nudges the service loop to re-check for a halt.
    Wake,
}

/// Issues requests into a motherboard's service loop.
///
/// Every call blocks until the loop has handled the request. Requests are only accepted while
/// the bus is running; one still queued when the bus halts fails with `Aborted`.
#[derive(Clone)]
pub struct BusClient {
    board: Weak<Board>,
}

impl BusClient {
    pub(crate) fn new(board: Weak<Board>) -> Self {
        Self { board }
    }

    fn call(&self, request: BusRequest) -> Result<Vec<u8>, DeviceError> {
        let board = self.board.upgrade().ok_or(DeviceError::NotRunning)?;
        let sender = {
            let inner = board.lock();
            if inner.state != BusState::Running {
                return Err(DeviceError::NotRunning);
            }
            lock(&board.sender).clone()
        };
        drop(board);

        let (reply, response) = mpsc::channel();
        sender
            .send(BusMessage::Request { request, reply })
            .map_err(|_| DeviceError::Aborted)?;
        response.recv().unwrap_or(Err(DeviceError::Aborted))
    }
}

impl BusAccess for BusClient {
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        self.call(BusRequest::Read { addr, len })
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.call(BusRequest::Write {
            addr,
            data: data.to_vec(),
        })
        .map(drop)
    }

    fn send_interrupt(&self, slot: usize, code: u32) -> Result<(), DeviceError> {
        self.call(BusRequest::Interrupt { slot, code }).map(drop)
    }
}
