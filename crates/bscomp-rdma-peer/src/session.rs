use bscomp_rdma_protocol::{Frame, Op, Status};

/// Per-connection memory served to one RDMA device.
///
/// Memory is allocated by the handshake; every other request before that is `NOT_READY`.
#[derive(Debug)]
pub struct PeerSession {
    max_capacity: u32,
    memory: Option<Vec<u8>>,
    next_alloc: u64,
}

/// What the connection should do after answering a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Continue,
    Close,
}

impl PeerSession {
    pub fn new(max_capacity: u32) -> Self {
        Self {
            max_capacity,
            memory: None,
            next_alloc: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.memory.as_ref().map_or(0, |m| m.len() as u64)
    }

    /// Answers one request frame.
    pub fn handle(&mut self, request: &Frame) -> (Frame, Next) {
        let reply = match request.op {
            Op::Close => return (request.reply(Status::Ok, Vec::new()), Next::Close),
            Op::Handshake => self.handshake(request),
            _ if self.memory.is_none() => request.reply(Status::NotReady, Vec::new()),
            Op::Read => self.read(request),
            Op::Write => self.write(request),
            Op::Allocate => self.allocate(request),
        };
        (reply, Next::Continue)
    }

    fn memory(&mut self) -> &mut [u8] {
        self.memory.as_deref_mut().unwrap_or_default()
    }

    fn read(&mut self, request: &Frame) -> Frame {
        let memory = self.memory();
        match range(request.offset, request.length, memory.len()) {
            Some(range) => request.reply(Status::Ok, memory[range].to_vec()),
            None => request.reply(Status::OutOfRange, Vec::new()),
        }
    }

    fn write(&mut self, request: &Frame) -> Frame {
        let memory = self.memory();
        match range(request.offset, request.length, memory.len()) {
            Some(range) => {
                memory[range].copy_from_slice(&request.payload);
                request.reply(Status::Ok, Vec::new())
            }
            None => request.reply(Status::OutOfRange, Vec::new()),
        }
    }

    /// Bump allocation; regions are never freed.
    fn allocate(&mut self, request: &Frame) -> Frame {
        let end = self.next_alloc + u64::from(request.length);
        if end > self.capacity() {
            return request.reply(Status::CapacityExceeded, Vec::new());
        }
        let start = self.next_alloc;
        self.next_alloc = end;
        request.reply(Status::Ok, Vec::new()).with_offset(start)
    }

    fn handshake(&mut self, request: &Frame) -> Frame {
        if self.memory.is_some() {
            return request.reply(Status::BadRequest, Vec::new());
        }

        let granted = match request.length {
            0 => self.max_capacity,
            requested if requested > self.max_capacity => {
                tracing::debug!(
                    requested,
                    max = self.max_capacity,
                    "rejecting handshake over capacity"
                );
                return request.reply(Status::CapacityExceeded, Vec::new());
            }
            requested => requested,
        };

        self.memory = Some(vec![0; granted as usize]);
        tracing::debug!(granted, config_len = request.payload.len(), "handshake accepted");
        request.reply(Status::Ok, Vec::new()).with_length(granted)
    }
}

fn range(offset: u64, length: u32, size: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(length as usize)?;
    (end <= size).then_some(start..end)
}
