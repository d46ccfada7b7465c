use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bscomp_device::{
    lock, BusAccess, ConfigBlob, Device, DeviceError, DeviceInfo, DeviceType, LifecycleState,
    StartError,
};
use bscomp_motherboard::{BusError, BusState, Coordinator, Motherboard, MotherboardConfig};
use bscomp_ram::RamDevice;

type Log = Arc<Mutex<Vec<String>>>;

/// Scriptable device recording its lifecycle calls into a shared log.
struct Probe {
    info: DeviceInfo,
    config: ConfigBlob,
    name: &'static str,
    size: u64,
    log: Log,
    state: Mutex<LifecycleState>,
    fail_start: bool,
    on_start: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    on_read: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    stop_delay: Duration,
    bus: Mutex<Option<Arc<dyn BusAccess>>>,
    interrupts: Mutex<Vec<u32>>,
}

impl Probe {
    fn new(name: &'static str, log: &Log) -> Self {
        Self {
            info: DeviceInfo::new(name, DeviceType::UNKNOWN),
            config: ConfigBlob::empty(),
            name,
            size: 0,
            log: Arc::clone(log),
            state: Mutex::new(LifecycleState::Constructed),
            fail_start: false,
            on_start: Mutex::new(None),
            on_read: Mutex::new(None),
            stop_delay: Duration::ZERO,
            bus: Mutex::new(None),
            interrupts: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self) -> Self {
        self.fail_start = true;
        self
    }

    fn sized(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    fn on_start(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *lock(&self.on_start) = Some(Box::new(hook));
        self
    }

    fn on_read(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *lock(&self.on_read) = Some(Box::new(hook));
        self
    }

    fn slow_stop(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    fn bus(&self) -> Arc<dyn BusAccess> {
        lock(&self.bus).clone().expect("attached")
    }
}

impl Device for Probe {
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
        *lock(&self.state)
    }

    fn start(&self) -> Result<(), StartError> {
        lock(&self.log).push(format!("start {}", self.name));
        if let Some(hook) = lock(&self.on_start).take() {
            hook();
        }
        if self.fail_start {
            return Err(StartError::Device("scripted failure".into()));
        }
        let mut state = lock(&self.state);
        state.check_start()?;
        *state = LifecycleState::Running;
        Ok(())
    }

    fn stop(&self) {
        // Every call is logged so that a repeated stop sequence shows up.
        lock(&self.log).push(format!("stop {}", self.name));
        std::thread::sleep(self.stop_delay);
        *lock(&self.state) = LifecycleState::Halted;
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        self.state().ensure_running()?;
        if let Some(hook) = lock(&self.on_read).take() {
            hook();
        }
        if offset == 0 {
            return Err(DeviceError::Failed(-7));
        }
        Ok(vec![self.size as u8; len])
    }

    fn write(&self, _offset: u64, _data: &[u8]) -> Result<(), DeviceError> {
        self.state().ensure_running()
    }

    fn interrupt(&self, code: u32) -> Result<(), DeviceError> {
        self.state().ensure_running()?;
        lock(&self.interrupts).push(code);
        Ok(())
    }

    fn connect_bus(&self, bus: Arc<dyn BusAccess>) {
        *lock(&self.bus) = Some(bus);
    }
}

fn board(slots: usize) -> Motherboard {
    Motherboard::with_config("board", MotherboardConfig { max_devices: slots }).unwrap()
}

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    lock(log).clone()
}

#[test]
fn ram_behind_the_bus() {
    let board = board(16);
    let ram = Arc::new(RamDevice::with_size(4096).unwrap());
    assert_eq!(board.attach(ram.clone()).unwrap(), 0);

    let coordinator = Coordinator::spawn(board.clone()).unwrap();
    assert_eq!(coordinator.wait_booted(), BusState::Running);

    let bus = board.client();
    bus.write(0, b"hi").unwrap();
    assert_eq!(bus.read(0, 2).unwrap(), b"hi");
    assert_eq!(
        bus.read(4096, 1),
        Err(DeviceError::AddressOutOfRange {
            offset: 4096,
            len: 1
        })
    );

    coordinator.halt().unwrap();
    assert_eq!(board.bus_state(), BusState::Halted);
    assert_eq!(ram.state(), LifecycleState::Halted);
    assert_eq!(bus.read(0, 2), Err(DeviceError::NotRunning));
}

#[test]
fn boots_in_order_and_halts_in_reverse() {
    let log = log();
    let board = board(4);
    for name in ["a", "b", "c"] {
        board.attach(Arc::new(Probe::new(name, &log))).unwrap();
    }

    let coordinator = Coordinator::spawn(board.clone()).unwrap();
    assert_eq!(coordinator.wait_booted(), BusState::Running);
    coordinator.halt().unwrap();

    assert_eq!(
        entries(&log),
        ["start a", "start b", "start c", "stop c", "stop b", "stop a"]
    );
}

#[test]
fn failed_start_rolls_back_started_devices() {
    let log = log();
    let board = board(4);
    board.attach(Arc::new(Probe::new("a", &log))).unwrap();
    board.attach(Arc::new(Probe::new("b", &log).failing())).unwrap();
    board.attach(Arc::new(Probe::new("c", &log))).unwrap();

    match board.boot() {
        Err(BusError::BootFailed { slot, identity, .. }) => {
            assert_eq!(slot, 1);
            assert_eq!(identity, "b");
        }
        other => panic!("unexpected boot result: {other:?}"),
    }

    assert_eq!(entries(&log), ["start a", "start b", "stop b", "stop a"]);
    assert_eq!(board.bus_state(), BusState::Halted);
    assert!(matches!(board.boot(), Err(BusError::Halted)));
    assert!(matches!(
        board.attach(Arc::new(Probe::new("d", &log))),
        Err(BusError::Halted)
    ));
}

#[test]
fn slots_are_bounded() {
    let log = log();
    let board = board(2);
    assert_eq!(board.num_slots(), 2);
    assert!(!board.is_full());

    board.attach(Arc::new(Probe::new("a", &log))).unwrap();
    board.attach(Arc::new(Probe::new("b", &log))).unwrap();
    assert_eq!(board.slots_filled(), 2);
    assert!(board.is_full());

    assert!(matches!(
        board.attach(Arc::new(Probe::new("c", &log))),
        Err(BusError::BusFull { max_devices: 2 })
    ));
}

#[test]
fn attach_is_rejected_once_booted() {
    let log = log();
    let board = board(4);
    board.attach(Arc::new(Probe::new("a", &log))).unwrap();

    let coordinator = Coordinator::spawn(board.clone()).unwrap();
    assert_eq!(coordinator.wait_booted(), BusState::Running);
    assert!(matches!(
        board.attach(Arc::new(Probe::new("late", &log))),
        Err(BusError::AlreadyBooting)
    ));
    assert!(matches!(board.boot(), Err(BusError::AlreadyBooting)));

    coordinator.halt().unwrap();
}

#[test]
fn halt_before_boot_stops_devices() {
    let log = log();
    let board = board(4);
    let probe = Arc::new(Probe::new("a", &log));
    board.attach(probe.clone()).unwrap();

    board.halt();
    board.halt();

    assert_eq!(board.bus_state(), BusState::Halted);
    assert_eq!(probe.state(), LifecycleState::Halted);
    assert_eq!(entries(&log), ["stop a"]);
    assert!(matches!(board.boot(), Err(BusError::Halted)));
}

#[test]
fn halt_during_boot_rolls_back() {
    let log = log();
    let board = board(4);
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    board
        .attach(Arc::new(Probe::new("a", &log).on_start(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        })))
        .unwrap();
    board.attach(Arc::new(Probe::new("b", &log))).unwrap();

    let coordinator = Coordinator::spawn(board.clone()).unwrap();
    started_rx.recv().unwrap();
    assert_eq!(board.bus_state(), BusState::Booting);

    let halter = {
        let board = board.clone();
        std::thread::spawn(move || board.halt())
    };
    // Let the halt request land while "a" is still starting.
    std::thread::sleep(Duration::from_millis(50));
    release_tx.send(()).unwrap();
    halter.join().unwrap();

    assert_eq!(board.bus_state(), BusState::Halted);
    coordinator.join().unwrap();
    assert_eq!(entries(&log), ["start a", "stop a"]);
}

#[test]
fn device_errors_do_not_stop_the_bus() {
    let log = log();
    let board = board(4);
    board
        .attach(Arc::new(Probe::new("a", &log).sized(8)))
        .unwrap();

    let coordinator = Coordinator::spawn(board.clone()).unwrap();
    assert_eq!(coordinator.wait_booted(), BusState::Running);

    let bus = board.client();
    assert_eq!(bus.read(0, 1), Err(DeviceError::Failed(-7)));
    assert_eq!(bus.read(1, 2).unwrap(), [8, 8]);
    assert_eq!(board.bus_state(), BusState::Running);

    coordinator.halt().unwrap();
}

#[test]
fn zero_sized_devices_take_no_addresses() {
    let log = log();
    let board = board(4);
    board.attach(Arc::new(Probe::new("cpu", &log))).unwrap();
    board
        .attach(Arc::new(RamDevice::with_size(16).unwrap()))
        .unwrap();
    assert_eq!(board.size(), 16);

    let coordinator = Coordinator::spawn(board.clone()).unwrap();
    assert_eq!(coordinator.wait_booted(), BusState::Running);

    let bus = board.client();
    bus.write(0, &[0xAB]).unwrap();
    assert_eq!(bus.read(0, 1).unwrap(), [0xAB]);

    coordinator.halt().unwrap();
}

#[test]
fn devices_reach_each_other_through_their_bus_handle() {
    let log = log();
    let board = board(4);
    let cpu = Arc::new(Probe::new("cpu", &log));
    let peer = Arc::new(Probe::new("peer", &log));
    board.attach(cpu.clone()).unwrap();
    board
        .attach(Arc::new(RamDevice::with_size(64).unwrap()))
        .unwrap();
    board.attach(peer.clone()).unwrap();

    // Not yet running.
    assert_eq!(cpu.bus().read(0, 1), Err(DeviceError::NotRunning));

    let coordinator = Coordinator::spawn(board.clone()).unwrap();
    assert_eq!(coordinator.wait_booted(), BusState::Running);

    let bus = cpu.bus();
    bus.write(32, b"from cpu").unwrap();
    assert_eq!(bus.read(32, 8).unwrap(), b"from cpu");

    bus.send_interrupt(2, 7).unwrap();
    assert_eq!(*lock(&peer.interrupts), [7]);
    assert_eq!(
        bus.send_interrupt(9, 1),
        Err(DeviceError::NoSuchSlot { slot: 9 })
    );
    assert_eq!(bus.send_interrupt(1, 1), Err(DeviceError::Unsupported));

    coordinator.halt().unwrap();
}

#[test]
fn motherboard_nests_as_a_device() {
    let inner = board(2);
    inner
        .attach(Arc::new(RamDevice::with_size(16).unwrap()))
        .unwrap();

    let outer = board(2);
    outer
        .attach(Arc::new(RamDevice::with_size(32).unwrap()))
        .unwrap();
    outer.attach(Arc::new(inner.clone())).unwrap();
    assert_eq!(outer.size(), 48);

    let coordinator = Coordinator::spawn(outer.clone()).unwrap();
    assert_eq!(coordinator.wait_booted(), BusState::Running);
    assert_eq!(inner.bus_state(), BusState::Running);

    let bus = outer.client();
    bus.write(40, b"nested").unwrap();
    assert_eq!(bus.read(40, 6).unwrap(), b"nested");
    assert_eq!(inner.client().read(8, 6).unwrap(), b"nested");

    coordinator.halt().unwrap();
    assert_eq!(inner.bus_state(), BusState::Halted);
    assert_eq!(Device::state(&inner), LifecycleState::Halted);
}

#[test]
fn dropping_the_coordinator_halts_the_bus() {
    let board = board(1);
    let ram = Arc::new(RamDevice::with_size(16).unwrap());
    board.attach(ram.clone()).unwrap();

    {
        let coordinator = Coordinator::spawn(board.clone()).unwrap();
        assert_eq!(coordinator.wait_booted(), BusState::Running);
    }

    assert_eq!(board.bus_state(), BusState::Halted);
    assert_eq!(ram.state(), LifecycleState::Halted);
}

#[test]
fn concurrent_halts_run_one_stop_sequence() {
    let log = log();
    let board = board(4);
    for name in ["a", "b"] {
        board
            .attach(Arc::new(
                Probe::new(name, &log).slow_stop(Duration::from_millis(50)),
            ))
            .unwrap();
    }

    let coordinator = Coordinator::spawn(board.clone()).unwrap();
    assert_eq!(coordinator.wait_booted(), BusState::Running);

    let barrier = Arc::new(std::sync::Barrier::new(2));
    let halters: Vec<_> = (0..2)
        .map(|_| {
            let board = board.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                board.halt();
                board.bus_state()
            })
        })
        .collect();
    for halter in halters {
        assert_eq!(halter.join().unwrap(), BusState::Halted);
    }

    coordinator.join().unwrap();
    assert_eq!(entries(&log), ["start a", "start b", "stop b", "stop a"]);
}

#[test]
fn requests_queued_at_halt_are_aborted() {
    let log = log();
    let board = board(2);
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    board
        .attach(Arc::new(Probe::new("slow", &log).sized(8).on_read(move || {
            entered_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        })))
        .unwrap();

    let coordinator = Coordinator::spawn(board.clone()).unwrap();
    assert_eq!(coordinator.wait_booted(), BusState::Running);

    // The first request parks the service loop inside the device.
    let in_flight = {
        let bus = board.client();
        std::thread::spawn(move || bus.read(1, 1))
    };
    entered_rx.recv().unwrap();

    let queued = {
        let bus = board.client();
        std::thread::spawn(move || bus.read(2, 1))
    };
    // Give the second request time to land in the queue behind the first.
    std::thread::sleep(Duration::from_millis(100));

    let halter = {
        let board = board.clone();
        std::thread::spawn(move || board.halt())
    };
    std::thread::sleep(Duration::from_millis(50));
    release_tx.send(()).unwrap();

    assert_eq!(in_flight.join().unwrap().unwrap(), [8]);
    assert_eq!(queued.join().unwrap(), Err(DeviceError::Aborted));
    halter.join().unwrap();
    coordinator.join().unwrap();
    assert_eq!(board.bus_state(), BusState::Halted);
}

#[test]
fn nested_boot_failure_fails_the_nested_start() {
    let log = log();
    let inner = board(2);
    inner
        .attach(Arc::new(
            Probe::new("inner-ok", &log).slow_stop(Duration::from_millis(300)),
        ))
        .unwrap();
    inner
        .attach(Arc::new(Probe::new("inner-bad", &log).failing()))
        .unwrap();

    assert!(matches!(
        Device::start(&inner),
        Err(StartError::Device(_))
    ));
    assert_eq!(inner.bus_state(), BusState::Halted);
    assert_eq!(
        entries(&log),
        ["start inner-ok", "start inner-bad", "stop inner-bad", "stop inner-ok"]
    );
}

#[test]
fn nested_boot_failure_rolls_back_the_outer_bus() {
    let log = log();
    let inner = board(2);
    inner
        .attach(Arc::new(
            Probe::new("inner-ok", &log).slow_stop(Duration::from_millis(100)),
        ))
        .unwrap();
    inner
        .attach(Arc::new(Probe::new("inner-bad", &log).failing()))
        .unwrap();

    let outer = board(2);
    outer.attach(Arc::new(Probe::new("outer", &log))).unwrap();
    outer.attach(Arc::new(inner.clone())).unwrap();

    match outer.boot() {
        Err(BusError::BootFailed { slot, .. }) => assert_eq!(slot, 1),
        other => panic!("unexpected boot result: {other:?}"),
    }
    assert_eq!(outer.bus_state(), BusState::Halted);
    assert_eq!(inner.bus_state(), BusState::Halted);
    assert_eq!(
        entries(&log),
        [
            "start outer",
            "start inner-ok",
            "start inner-bad",
            "stop inner-bad",
            "stop inner-ok",
            "stop outer",
        ]
    );
}
