use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use bscomp_device::{
    lock, BusAccess, ConfigBlob, ConstructionError, Device, DeviceError, DeviceInfo, DeviceType,
    LifecycleState, StartError,
};

use crate::address_map::AddressMap;
use crate::client::{BusClient, BusMessage, BusRequest};
use crate::coordinator::{join_boot, spawn_boot};
use crate::{BusError, MotherboardConfig};

/// Upper bound on how long the service loop goes without checking for a halt request.
const HALT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// `Assembling → Booting → Running → Halting → Halted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Assembling,
    Booting,
    Running,
    Halting,
    Halted,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BusState::Assembling => "assembling",
            BusState::Booting => "booting",
            BusState::Running => "running",
            BusState::Halting => "halting",
            BusState::Halted => "halted",
        };
        f.write_str(s)
    }
}

/// The bus: an ordered set of device slots, a boot sequence, and the loop that routes bus
/// requests to devices.
///
/// Cloning yields another handle to the same board.
#[derive(Clone)]
pub struct Motherboard {
    pub(crate) board: Arc<Board>,
}

pub(crate) struct Board {
    info: DeviceInfo,
    config: ConfigBlob,
    max_devices: usize,
    inner: Mutex<BoardInner>,
    changed: Condvar,
    /// Request queue feeding the service loop; the receiver is taken by `boot`.
    pub(crate) sender: Mutex<mpsc::Sender<BusMessage>>,
    /// Boot thread started through the `Device` interface.
    nested: Mutex<Option<JoinHandle<Result<(), BusError>>>>,
}

pub(crate) struct BoardInner {
    pub(crate) state: BusState,
    devices: Vec<Arc<dyn Device>>,
    halt_requested: bool,
    receiver: Option<mpsc::Receiver<BusMessage>>,
}

impl Motherboard {
    pub fn new(identity: impl Into<String>, config: ConfigBlob) -> Result<Self, ConstructionError> {
        let cfg = MotherboardConfig::from_blob(&config)?;
        if cfg.max_devices == 0 {
            return Err(ConstructionError::ConstructionRejected(
                "motherboard needs at least one slot".to_string(),
            ));
        }

        let info = DeviceInfo::new(identity, DeviceType::MOTHERBOARD);
        tracing::debug!(device = %info, max_devices = cfg.max_devices, "constructed motherboard");

        let (sender, receiver) = mpsc::channel();
        Ok(Self {
            board: Arc::new(Board {
                info,
                config,
                max_devices: cfg.max_devices,
                inner: Mutex::new(BoardInner {
                    state: BusState::Assembling,
                    devices: Vec::new(),
                    halt_requested: false,
                    receiver: Some(receiver),
                }),
                changed: Condvar::new(),
                sender: Mutex::new(sender),
                nested: Mutex::new(None),
            }),
        })
    }

    pub fn with_config(
        identity: impl Into<String>,
        cfg: MotherboardConfig,
    ) -> Result<Self, ConstructionError> {
        Self::new(identity, cfg.to_blob())
    }

    pub fn bus_state(&self) -> BusState {
        self.board.lock().state
    }

    pub fn num_slots(&self) -> usize {
        self.board.max_devices
    }

    pub fn slots_filled(&self) -> usize {
        self.board.lock().devices.len()
    }

    pub fn is_full(&self) -> bool {
        self.slots_filled() >= self.num_slots()
    }

    pub fn device(&self, slot: usize) -> Option<Arc<dyn Device>> {
        self.board.lock().devices.get(slot).cloned()
    }

    /// A handle for issuing bus requests, as handed to attached devices.
    pub fn client(&self) -> BusClient {
        BusClient::new(Arc::downgrade(&self.board))
    }

    /// Appends `device` to the next free slot and returns the slot index.
    pub fn attach(&self, device: Arc<dyn Device>) -> Result<usize, BusError> {
        let slot = {
            let mut inner = self.board.lock();
            match inner.state {
                BusState::Assembling => {}
                BusState::Halting | BusState::Halted => return Err(BusError::Halted),
                _ => return Err(BusError::AlreadyBooting),
            }
            if inner.devices.len() >= self.board.max_devices {
                return Err(BusError::BusFull {
                    max_devices: self.board.max_devices,
                });
            }
            inner.devices.push(Arc::clone(&device));
            inner.devices.len() - 1
        };

        device.connect_bus(Arc::new(self.client()));
        tracing::info!(slot, device = %device.info(), size = device.size(), "device attached");
        Ok(slot)
    }

    /// Starts every attached device in slot order, then serves bus requests until halted.
    ///
    /// Blocks for the whole running lifetime of the bus. If a device fails to start, the devices
    /// started so far are stopped in reverse order and `BootFailed` is returned. A halt requested
    /// while booting rolls back the same way and returns `Ok`.
    pub fn boot(&self) -> Result<(), BusError> {
        let (devices, receiver) = {
            let mut inner = self.board.lock();
            match inner.state {
                BusState::Assembling => {}
                BusState::Halting | BusState::Halted => return Err(BusError::Halted),
                _ => return Err(BusError::AlreadyBooting),
            }
            let Some(receiver) = inner.receiver.take() else {
                return Err(BusError::AlreadyBooting);
            };
            self.board.set_state(&mut inner, BusState::Booting);
            (inner.devices.clone(), receiver)
        };

        tracing::info!(board = %self.board.info, devices = devices.len(), "booting");

        for (slot, device) in devices.iter().enumerate() {
            if self.board.lock().halt_requested {
                tracing::info!(slot, "halt requested during boot");
                self.board.finish(&devices[..slot]);
                return Ok(());
            }

            if let Err(source) = device.start() {
                tracing::error!(slot, device = %device.info(), "device failed to start: {source}");
                // The failed device may hold partially acquired resources.
                device.stop();
                self.board.finish(&devices[..slot]);
                return Err(BusError::BootFailed {
                    slot,
                    identity: device.info().identity.clone(),
                    source,
                });
            }
            tracing::debug!(slot, device = %device.info(), "device started");
        }

        let map = AddressMap::new(devices.iter().map(|d| d.size()));
        {
            let mut inner = self.board.lock();
            if inner.halt_requested {
                drop(inner);
                self.board.finish(&devices);
                return Ok(());
            }
            self.board.set_state(&mut inner, BusState::Running);
        }
        tracing::info!(board = %self.board.info, mapped = map.size(), "bus running");

        self.board.serve(&devices, &map, receiver);
        self.board.finish(&devices);
        Ok(())
    }

    /// Stops the bus and every attached device, and waits until the bus is `Halted`.
    ///
    /// Safe to call from any thread and any number of times.
    pub fn halt(&self) {
        let mut inner = self.board.lock();
        match inner.state {
            BusState::Assembling => {
                self.board.set_state(&mut inner, BusState::Halting);
                let devices = inner.devices.clone();
                drop(inner);
                self.board.finish(&devices);
                return;
            }
            BusState::Booting => inner.halt_requested = true,
            BusState::Running => {
                inner.halt_requested = true;
                self.board.set_state(&mut inner, BusState::Halting);
            }
            BusState::Halting | BusState::Halted => {}
        }
        drop(inner);

        // Wake the service loop rather than waiting out its poll interval.
        let _ = lock(&self.board.sender).send(BusMessage::Wake);

        let _ = self.wait_while(|state| state != BusState::Halted);
    }

    /// Blocks until boot has settled and returns the resulting state: `Running` on success,
    /// `Halted` once a failed or interrupted boot has finished rolling back.
    ///
    /// Only meaningful once a boot is under way on another thread.
    pub fn wait_booted(&self) -> BusState {
        self.wait_while(|state| !matches!(state, BusState::Running | BusState::Halted))
    }

    fn wait_while(&self, mut pending: impl FnMut(BusState) -> bool) -> BusState {
        let inner = self.board.lock();
        let inner = self
            .board
            .changed
            .wait_while(inner, |inner| pending(inner.state))
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.state
    }
}

impl Board {
    pub(crate) fn lock(&self) -> MutexGuard<'_, BoardInner> {
        lock(&self.inner)
    }

    fn set_state(&self, inner: &mut BoardInner, state: BusState) {
        tracing::debug!(board = %self.info, from = %inner.state, to = %state, "bus state change");
        inner.state = state;
        self.changed.notify_all();
    }

    /// Stops `devices` in reverse slot order and marks the bus `Halted`.
    fn finish(&self, devices: &[Arc<dyn Device>]) {
        {
            let mut inner = self.lock();
            if inner.state != BusState::Halting {
                self.set_state(&mut inner, BusState::Halting);
            }
        }

        for (slot, device) in devices.iter().enumerate().rev() {
            device.stop();
            tracing::debug!(slot, device = %device.info(), "device stopped");
        }

        let mut inner = self.lock();
        self.set_state(&mut inner, BusState::Halted);
        tracing::info!(board = %self.info, "bus halted");
    }

    /// The request loop. Returns once a halt has been requested; dropping `receiver` aborts any
    /// request still queued.
    fn serve(
        &self,
        devices: &[Arc<dyn Device>],
        map: &AddressMap,
        receiver: mpsc::Receiver<BusMessage>,
    ) {
        loop {
            if self.lock().halt_requested {
                return;
            }

            match receiver.recv_timeout(HALT_POLL_INTERVAL) {
                Ok(BusMessage::Request { request, reply }) => {
                    let result = dispatch(devices, map, request);
                    if let Err(err) = &result {
                        tracing::debug!("bus request failed: {err}");
                    }
                    let _ = reply.send(result);
                }
                Ok(BusMessage::Wake) | Err(RecvTimeoutError::Timeout) => {}
                // Unreachable while the board holds a sender, but there is nothing left to serve.
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

fn dispatch(
    devices: &[Arc<dyn Device>],
    map: &AddressMap,
    request: BusRequest,
) -> Result<Vec<u8>, DeviceError> {
    match request {
        BusRequest::Read { addr, len } => {
            let (slot, offset) = map.translate(addr, len)?;
            devices[slot].read(offset, len)
        }
        BusRequest::Write { addr, data } => {
            let (slot, offset) = map.translate(addr, data.len())?;
            devices[slot].write(offset, &data)?;
            Ok(Vec::new())
        }
        BusRequest::Interrupt { slot, code } => {
            let device = devices.get(slot).ok_or(DeviceError::NoSuchSlot { slot })?;
            device.interrupt(code)?;
            Ok(Vec::new())
        }
    }
}

/// A motherboard is itself a device: starting it boots the bus on its own thread, stopping it
/// halts the bus. Its memory window spans every device attached to it.
impl Device for Motherboard {
    fn info(&self) -> &DeviceInfo {
        &self.board.info
    }

    fn config(&self) -> &ConfigBlob {
        &self.board.config
    }

    fn size(&self) -> u64 {
        AddressMap::new(self.board.lock().devices.iter().map(|d| d.size())).size()
    }

    fn state(&self) -> LifecycleState {
        match self.bus_state() {
            BusState::Assembling | BusState::Booting => LifecycleState::Constructed,
            BusState::Running => LifecycleState::Running,
            BusState::Halting | BusState::Halted => LifecycleState::Halted,
        }
    }

    fn start(&self) -> Result<(), StartError> {
        match self.bus_state() {
            BusState::Assembling => {}
            BusState::Booting | BusState::Running => return Err(StartError::AlreadyRunning),
            BusState::Halting | BusState::Halted => return Err(StartError::Halted),
        }

        let mut nested = lock(&self.board.nested);
        if nested.is_some() {
            return Err(StartError::AlreadyRunning);
        }
        let handle = spawn_boot(self.clone()).map_err(|err| StartError::Device(err.to_string()))?;

        match self.wait_booted() {
            BusState::Running => {
                *nested = Some(handle);
                Ok(())
            }
            _ => Err(match join_boot(handle) {
                Err(err) => StartError::Device(err.to_string()),
                Ok(()) => StartError::Halted,
            }),
        }
    }

    fn stop(&self) {
        self.halt();
        let handle = lock(&self.board.nested).take();
        if let Some(handle) = handle {
            if let Err(err) = join_boot(handle) {
                tracing::warn!(board = %self.board.info, "boot ended with error: {err}");
            }
        }
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        self.client().read(offset, len)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.client().write(offset, data)
    }
}
