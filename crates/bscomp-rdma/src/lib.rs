//! Remote memory device.
//!
//! [`RdmaDevice`] exposes memory held by a peer process as a bus device. Every operation is one
//! request/response exchange over a single TCP connection using the `bscomp-rdma-protocol`
//! framing. Responses are matched strictly against the oldest outstanding request; any deviation
//! tears the session down.

mod dial;
mod session;

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, TryLockError};
use std::thread;
use std::time::Duration;

use bscomp_device::{
    check_range, lock, ConfigBlob, ConstructionError, Device, DeviceError, DeviceInfo, DeviceType,
    LifecycleState, StartError,
};
use bscomp_rdma_protocol::{encode_frame_with_limits, Frame, Limits, Op, Status};

use session::{Link, Reply, Shared};

/// Connection settings for [`RdmaDevice`].
#[derive(Debug, Clone)]
pub struct RdmaConfig {
    pub connect_timeout: Duration,
    /// How long a request may wait for its response before the session is declared broken.
    pub response_timeout: Duration,
    pub limits: Limits,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            limits: Limits::default(),
        }
    }
}

pub struct RdmaDevice {
    info: DeviceInfo,
    config: ConfigBlob,
    settings: RdmaConfig,
    requested_capacity: u32,
    /// Capacity granted by the peer during the handshake.
    capacity: AtomicU64,
    shared: Arc<Shared>,
}

impl RdmaDevice {
    /// Connects to the peer at `host:port` with default settings.
    pub fn connect(host: &str, port: u16, config: ConfigBlob) -> Result<Self, ConstructionError> {
        Self::connect_with(host, port, config, RdmaConfig::default())
    }

    /// Connects to the peer at `host:port`.
    ///
    /// The configuration's primary field, if present, is the capacity requested from the peer;
    /// zero leaves the choice to the peer. The blob itself is forwarded verbatim in the handshake.
    pub fn connect_with(
        host: &str,
        port: u16,
        config: ConfigBlob,
        settings: RdmaConfig,
    ) -> Result<Self, ConstructionError> {
        let requested_capacity = config.decode()?.primary().unwrap_or(0);
        let stream = dial::dial(
            host,
            port,
            settings.connect_timeout,
            settings.response_timeout,
        )?;

        let endpoint = format!("{host}:{port}");
        let info = DeviceInfo::new(format!("rdma://{endpoint}"), DeviceType::RDMA);
        tracing::debug!(device = %info, requested_capacity, "constructed RDMA device");

        Ok(Self {
            info,
            config,
            settings,
            requested_capacity,
            capacity: AtomicU64::new(0),
            shared: Arc::new(Shared::new(endpoint, stream)?),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Reserves `len` bytes of the peer's memory, returning the offset of the region.
    pub fn allocate(&self, len: u32) -> Result<u64, DeviceError> {
        let reply = self.call(|id| Frame::allocate(id, len))?;
        let reply = check_reply(reply, Op::Allocate)?;
        Ok(reply.offset)
    }

    /// Largest payload carried by one frame; bigger transfers are split.
    fn max_chunk(&self) -> usize {
        self.settings.limits.max_payload_len.clamp(1, u32::MAX as usize)
    }

    /// Assigns a request id, registers the waiter and writes the frame while holding `link`, so
    /// that frames hit the wire in request id order.
    ///
    /// A failed write tears the session down; the returned receiver then yields the reason.
    fn issue(
        &self,
        link: &mut Link,
        build: impl FnOnce(u64) -> Frame,
    ) -> Result<(u64, mpsc::Receiver<Reply>), DeviceError> {
        let request_id = link.next_id;
        link.next_id = link.next_id.wrapping_add(1);

        let frame = build(request_id);
        let bytes = encode_frame_with_limits(&frame, &self.settings.limits)
            .map_err(|err| DeviceError::ProtocolError(err.to_string()))?;

        let rx = lock(&self.shared.pending).register(request_id)?;

        let Some(stream) = link.stream.as_mut() else {
            return Err(DeviceError::ConnectionLost);
        };
        tracing::trace!(endpoint = %self.shared.endpoint, request_id, op = ?frame.op, "rdma request");
        if let Err(err) = stream.write_all(&bytes) {
            let reason = match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => DeviceError::ProtocolError(
                    format!("peer stopped reading request {request_id}"),
                ),
                _ => DeviceError::ConnectionLost,
            };
            tracing::debug!(endpoint = %self.shared.endpoint, "rdma write failed: {err}");
            if self.shared.fail_locked(link, reason.clone()) {
                tracing::warn!(endpoint = %self.shared.endpoint, "rdma session failed: {reason}");
            }
        }

        Ok((request_id, rx))
    }

    fn wait(&self, request_id: u64, rx: mpsc::Receiver<Reply>) -> Result<Frame, DeviceError> {
        match rx.recv_timeout(self.settings.response_timeout) {
            Ok(reply) => reply,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let err = DeviceError::ProtocolError(format!(
                    "no response to request {request_id} within {:?}",
                    self.settings.response_timeout
                ));
                self.shared.fail(err.clone());
                Err(err)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DeviceError::Aborted),
        }
    }

    fn call(&self, build: impl FnOnce(u64) -> Frame) -> Result<Frame, DeviceError> {
        let (request_id, rx) = {
            let mut link = lock(&self.shared.link);
            link.state.ensure_running()?;
            self.issue(&mut link, build)?
        };
        self.wait(request_id, rx)
    }

    fn spawn_reader(&self, link: &mut Link) -> Result<(), StartError> {
        let stream = link
            .stream
            .as_ref()
            .ok_or(StartError::Halted)?
            .try_clone()
            .map_err(|err| StartError::Device(err.to_string()))?;

        let shared = Arc::clone(&self.shared);
        let limits = self.settings.limits;
        let handle = thread::Builder::new()
            .name(format!("rdma-reader-{}", self.shared.endpoint))
            .spawn(move || session::read_loop(stream, shared, limits))
            .map_err(|err| StartError::Device(err.to_string()))?;
        link.reader = Some(handle);
        Ok(())
    }
}

/// Reports a chunk's range error against the whole request.
fn whole_request(err: DeviceError, offset: u64, len: usize) -> DeviceError {
    match err {
        DeviceError::AddressOutOfRange { .. } => DeviceError::AddressOutOfRange { offset, len },
        err => err,
    }
}

/// Validates a response against the request it answers.
fn check_reply(frame: Frame, op: Op) -> Result<Frame, DeviceError> {
    if frame.op != op {
        return Err(DeviceError::ProtocolError(format!(
            "expected a {op:?} response, got {:?}",
            frame.op
        )));
    }
    match frame.status {
        Status::Ok => Ok(frame),
        Status::OutOfRange => Err(DeviceError::AddressOutOfRange {
            offset: frame.offset,
            len: frame.length as usize,
        }),
        status => Err(DeviceError::ProtocolError(format!("peer answered {status}"))),
    }
}

impl Device for RdmaDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn config(&self) -> &ConfigBlob {
        &self.config
    }

    fn size(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    fn state(&self) -> LifecycleState {
        lock(&self.shared.link).state
    }

    fn start(&self) -> Result<(), StartError> {
        let (request_id, rx) = {
            let mut link = lock(&self.shared.link);
            link.state.check_start()?;
            if link.reader.is_none() {
                self.spawn_reader(&mut link)?;
            }
            let requested = self.requested_capacity;
            let config = self.config.as_bytes();
            self.issue(&mut link, |id| Frame::handshake(id, requested, config))
                .map_err(|err| StartError::HandshakeFailed(err.to_string()))?
        };

        let reply = self
            .wait(request_id, rx)
            .and_then(|frame| check_reply(frame, Op::Handshake));

        let mut link = lock(&self.shared.link);
        let granted = match reply {
            Ok(frame) => frame.length,
            Err(err) => {
                self.shared.fail_locked(&mut link, err.clone());
                tracing::warn!(device = %self.info, "rdma handshake failed: {err}");
                return Err(StartError::HandshakeFailed(err.to_string()));
            }
        };

        // A concurrent stop wins over a late handshake response.
        link.state.check_start()?;

        if granted < self.requested_capacity {
            self.shared.fail_locked(&mut link, DeviceError::Aborted);
            return Err(StartError::HandshakeFailed(format!(
                "peer granted {granted} bytes, {} requested",
                self.requested_capacity
            )));
        }

        self.capacity.store(u64::from(granted), Ordering::Release);
        link.state = LifecycleState::Running;
        tracing::info!(device = %self.info, capacity = granted, "rdma device running");
        Ok(())
    }

    fn stop(&self) {
        let reader = {
            let mut link = match self.shared.link.try_lock() {
                Ok(link) => link,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    // A request may be stuck writing; cutting the socket makes it let go.
                    self.shared.interrupt(DeviceError::Aborted);
                    lock(&self.shared.link)
                }
            };
            if link.state.is_running() {
                let request_id = link.next_id;
                link.next_id = link.next_id.wrapping_add(1);
                if let (Some(stream), Ok(bytes)) = (
                    link.stream.as_mut(),
                    encode_frame_with_limits(&Frame::close(request_id), &self.settings.limits),
                ) {
                    let _ = stream.write_all(&bytes);
                }
            }
            if self.shared.fail_locked(&mut link, DeviceError::Aborted) {
                tracing::debug!(device = %self.info, "rdma device stopped");
            }
            link.reader.take()
        };

        if let Some(handle) = reader {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        self.state().ensure_running()?;
        check_range(offset, len, self.size())?;

        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let at = offset + out.len() as u64;
            let chunk = (len - out.len()).min(self.max_chunk());
            let reply = self
                .call(|id| Frame::read(id, at, chunk as u32))
                .and_then(|frame| check_reply(frame, Op::Read))
                .map_err(|err| whole_request(err, offset, len))?;
            if reply.payload.len() != chunk {
                return Err(DeviceError::ProtocolError(format!(
                    "read of {chunk} bytes at {at} answered with {} bytes",
                    reply.payload.len()
                )));
            }
            out.extend_from_slice(&reply.payload);
        }
        Ok(out)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.state().ensure_running()?;
        check_range(offset, data.len(), self.size())?;

        let max_chunk = self.max_chunk();
        for (i, chunk) in data.chunks(max_chunk).enumerate() {
            let at = offset + (i * max_chunk) as u64;
            self.call(|id| Frame::write(id, at, chunk))
                .and_then(|frame| check_reply(frame, Op::Write))
                .map_err(|err| whole_request(err, offset, data.len()))?;
        }
        Ok(())
    }
}

impl Drop for RdmaDevice {
    fn drop(&mut self) {
        self.stop();
    }
}
