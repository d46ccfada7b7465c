use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bscomp_device::{lock, DeviceError, LifecycleState};
use bscomp_rdma_protocol::{Frame, FrameParser, Limits};

pub(crate) type Reply = Result<Frame, DeviceError>;

const READ_CHUNK: usize = 64 * 1024;

/// State shared between the device handle and its reader thread.
///
/// Lock order is `link` before `pending`.
pub(crate) struct Shared {
    pub(crate) endpoint: String,
    /// Clone of the socket used only to shut it down; usable without taking `link`.
    control: TcpStream,
    pub(crate) link: Mutex<Link>,
    pub(crate) pending: Mutex<Pending>,
}

pub(crate) struct Link {
    pub(crate) state: LifecycleState,
    /// Write half of the connection. `None` once the session is torn down.
    pub(crate) stream: Option<TcpStream>,
    pub(crate) reader: Option<JoinHandle<()>>,
    pub(crate) next_id: u64,
}

impl Shared {
    pub(crate) fn new(endpoint: String, stream: TcpStream) -> io::Result<Self> {
        Ok(Self {
            endpoint,
            control: stream.try_clone()?,
            link: Mutex::new(Link {
                state: LifecycleState::Constructed,
                stream: Some(stream),
                reader: None,
                next_id: 0,
            }),
            pending: Mutex::new(Pending::default()),
        })
    }

    /// Fails every waiter with `err` and shuts the socket down without waiting for `link`.
    ///
    /// A writer blocked on the socket gets an error back and releases `link`.
    pub(crate) fn interrupt(&self, err: DeviceError) {
        lock(&self.pending).close(err);
        let _ = self.control.shutdown(Shutdown::Both);
    }

    /// Tears the session down: every waiter fails with `err`, the socket is shut down and the
    /// device leaves `Running` for good.
    ///
    /// Returns `false` if the session had already been torn down.
    pub(crate) fn fail_locked(&self, link: &mut Link, err: DeviceError) -> bool {
        let first = lock(&self.pending).close(err);
        link.state = LifecycleState::Halted;
        if let Some(stream) = link.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        first
    }

    pub(crate) fn fail(&self, err: DeviceError) {
        let mut link = lock(&self.link);
        if self.fail_locked(&mut link, err.clone()) {
            tracing::warn!(endpoint = %self.endpoint, "rdma session failed: {err}");
        }
    }
}

/// Requests awaiting a response, oldest first.
#[derive(Default)]
pub(crate) struct Pending {
    waiters: VecDeque<(u64, mpsc::Sender<Reply>)>,
    closed: Option<DeviceError>,
}

impl Pending {
    pub(crate) fn register(&mut self, request_id: u64) -> Result<mpsc::Receiver<Reply>, DeviceError> {
        if let Some(err) = &self.closed {
            return Err(err.clone());
        }
        let (tx, rx) = mpsc::channel();
        self.waiters.push_back((request_id, tx));
        Ok(rx)
    }

    /// Hands `frame` to the oldest outstanding request.
    ///
    /// Anything other than a response to that exact request id is a protocol violation.
    pub(crate) fn complete(&mut self, frame: Frame) -> Result<(), DeviceError> {
        if !frame.response {
            return Err(DeviceError::ProtocolError(format!(
                "peer sent a {:?} request frame",
                frame.op
            )));
        }

        let Some(&(expected, _)) = self.waiters.front() else {
            return Err(DeviceError::ProtocolError(format!(
                "unsolicited response for request {}",
                frame.request_id
            )));
        };
        if expected != frame.request_id {
            return Err(DeviceError::ProtocolError(format!(
                "response for request {} arrived while request {expected} was outstanding",
                frame.request_id
            )));
        }

        if let Some((_, tx)) = self.waiters.pop_front() {
            // The waiter may have given up already; nothing to deliver to then.
            let _ = tx.send(Ok(frame));
        }
        Ok(())
    }

    /// Fails every waiter with `err`. Only the first close takes effect.
    pub(crate) fn close(&mut self, err: DeviceError) -> bool {
        if self.closed.is_some() {
            return false;
        }
        for (_, tx) in self.waiters.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
        self.closed = Some(err);
        true
    }
}

/// Reader thread body: decodes frames until the connection ends, then tears the session down.
pub(crate) fn read_loop(mut stream: TcpStream, shared: Arc<Shared>, limits: Limits) {
    let mut parser = FrameParser::with_limits(limits);
    let mut buf = vec![0u8; READ_CHUNK];

    let err = loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                if let Err(err) = parser.finish() {
                    tracing::debug!(endpoint = %shared.endpoint, "peer closed mid-frame: {err}");
                }
                break DeviceError::ConnectionLost;
            }
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(endpoint = %shared.endpoint, "rdma read failed: {err}");
                break DeviceError::ConnectionLost;
            }
        };

        let frames = match parser.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(err) => break DeviceError::ProtocolError(err.to_string()),
        };

        if let Err(err) = dispatch(&shared, frames) {
            break err;
        }
    };

    shared.fail(err);
}

fn dispatch(shared: &Shared, frames: Vec<Frame>) -> Result<(), DeviceError> {
    let mut pending = lock(&shared.pending);
    for frame in frames {
        tracing::trace!(
            endpoint = %shared.endpoint,
            request_id = frame.request_id,
            op = ?frame.op,
            status = %frame.status,
            "rdma response"
        );
        pending.complete(frame)?;
    }
    Ok(())
}
