#![cfg(not(target_arch = "wasm32"))]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bridgesim::loader::Loader;
use bridgesim::motherboard::MotherboardConfig;
use bridgesim::rdma::RdmaDevice;
use bridgesim::{
    BusAccess, BusState, ConfigBlob, Coordinator, Device, DeviceError, LifecycleState, Motherboard,
};
use bscomp_rdma_peer::{start_server, PeerConfig, ServerHandle};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn peer(capacity: u32) -> ServerHandle {
    start_server(PeerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        capacity,
        ..PeerConfig::default()
    })
    .await
    .unwrap()
}

fn reference_board() -> Motherboard {
    let board = Motherboard::new("motherboard", ConfigBlob::from_u32(16)).unwrap();
    let ram = Loader::new()
        .load("bscomp-ram", ConfigBlob::from_u32(4096))
        .unwrap();
    assert_eq!(board.attach(Arc::from(ram)).unwrap(), 0);
    board
}

#[test]
fn reference_computer_boots_serves_and_halts() {
    init_tracing();
    let board = reference_board();
    assert_eq!(board.num_slots(), 16);
    assert_eq!(board.slots_filled(), 1);

    let coordinator = Coordinator::spawn(board.clone()).unwrap();
    assert_eq!(coordinator.wait_booted(), BusState::Running);
    assert_eq!(board.size(), 4096);

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
    assert_eq!(board.device(0).unwrap().state(), LifecycleState::Halted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_memory_is_mapped_after_ram() {
    init_tracing();
    let server = peer(64 * 1024).await;
    let port = server.local_addr().port();

    tokio::task::spawn_blocking(move || {
        let board = reference_board();
        let rdma = Arc::new(
            RdmaDevice::connect("127.0.0.1", port, ConfigBlob::from_u32(8192)).unwrap(),
        );
        assert_eq!(board.attach(rdma.clone()).unwrap(), 1);

        let coordinator = Coordinator::spawn(board.clone()).unwrap();
        assert_eq!(coordinator.wait_booted(), BusState::Running);
        assert_eq!(board.size(), 4096 + 8192);

        let bus = board.client();
        bus.write(4096 + 10, b"remote").unwrap();
        assert_eq!(bus.read(4096 + 10, 6).unwrap(), b"remote");
        assert_eq!(rdma.read(10, 6).unwrap(), b"remote");

        bus.write(0, b"local").unwrap();
        assert_eq!(bus.read(0, 5).unwrap(), b"local");

        // A request spanning both windows belongs to neither device.
        assert_eq!(
            bus.read(4094, 4),
            Err(DeviceError::AddressOutOfRange {
                offset: 4094,
                len: 4
            })
        );

        coordinator.halt().unwrap();
        assert_eq!(rdma.state(), LifecycleState::Halted);
        assert_eq!(bus.read(4096, 1), Err(DeviceError::NotRunning));
    })
    .await
    .unwrap();

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn losing_the_peer_leaves_local_memory_usable() {
    init_tracing();
    let server = peer(64 * 1024).await;
    let port = server.local_addr().port();

    let (board, coordinator) = tokio::task::spawn_blocking(move || {
        let board = reference_board();
        let rdma = RdmaDevice::connect("127.0.0.1", port, ConfigBlob::from_u32(4096)).unwrap();
        board.attach(Arc::new(rdma)).unwrap();
        let coordinator = Coordinator::spawn(board.clone()).unwrap();
        assert_eq!(coordinator.wait_booted(), BusState::Running);
        (board, coordinator)
    })
    .await
    .unwrap();

    server.shutdown().await;

    tokio::task::spawn_blocking(move || {
        let bus = board.client();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match bus.read(4096, 1) {
                Err(err) => break err,
                Ok(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
                Ok(_) => panic!("remote memory still reachable after peer shutdown"),
            }
        };
        assert!(
            matches!(err, DeviceError::ConnectionLost | DeviceError::NotRunning),
            "unexpected error: {err}"
        );
        assert_eq!(board.device(1).unwrap().state(), LifecycleState::Halted);

        assert_eq!(board.bus_state(), BusState::Running);
        bus.write(8, b"still here").unwrap();
        assert_eq!(bus.read(8, 10).unwrap(), b"still here");

        coordinator.halt().unwrap();
    })
    .await
    .unwrap();
}
