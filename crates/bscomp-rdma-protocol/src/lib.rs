#![forbid(unsafe_code)]

//! `bscomp-rdma-v1` protocol codec.
//!
//! Request/response framing spoken between an RDMA device and its remote memory peer over a
//! stream connection. Every frame carries the same fixed header; responses echo the request's op
//! and id, set the RESPONSE flag and carry a status code.
//!
//! Wire format (all integer fields big-endian):
//!
//! ```text
//! 0      1      2      3      4              12             20        24        28
//! +------+------+------+------+--------------+--------------+---------+---------+
//! | ver  |  op  |flags |status| request_id   |   offset     | length  | pay_len |
//! +------+------+------+------+--------------+--------------+---------+---------+
//! | payload (pay_len bytes)                                                      |
//! +-----------------------------------------------------------------------------+
//! ```

use core::fmt;

pub const RDMA_PROTOCOL_VERSION: u8 = 1;

pub const RDMA_HEADER_LEN: usize = 28;

/// Set on every frame sent by the peer in reply to a request.
pub const RDMA_FLAG_RESPONSE: u8 = 0x01;

pub const RDMA_DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_payload_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_len: RDMA_DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Capacity negotiation. Request `length` is the requested capacity (0 = peer default) and the
    /// payload is the device's configuration blob; the response `length` is the granted capacity.
    Handshake,
    Read,
    Write,
    /// Reserve `length` bytes; the response `offset` is the start of the region.
    Allocate,
    /// Orderly goodbye. The peer replies and closes the connection.
    Close,
}

impl Op {
    pub fn to_u8(self) -> u8 {
        match self {
            Op::Handshake => 1,
            Op::Read => 2,
            Op::Write => 3,
            Op::Allocate => 4,
            Op::Close => 5,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, Error> {
        Ok(match v {
            1 => Op::Handshake,
            2 => Op::Read,
            3 => Op::Write,
            4 => Op::Allocate,
            5 => Op::Close,
            op => return Err(Error::UnknownOp { op }),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    OutOfRange,
    BadRequest,
    CapacityExceeded,
    /// The request arrived before a successful handshake.
    NotReady,
    Internal,
}

impl Status {
    pub fn to_u8(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::OutOfRange => 1,
            Status::BadRequest => 2,
            Status::CapacityExceeded => 3,
            Status::NotReady => 4,
            Status::Internal => 5,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, Error> {
        Ok(match v {
            0 => Status::Ok,
            1 => Status::OutOfRange,
            2 => Status::BadRequest,
            3 => Status::CapacityExceeded,
            4 => Status::NotReady,
            5 => Status::Internal,
            status => return Err(Error::UnknownStatus { status }),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::OutOfRange => "out of range",
            Status::BadRequest => "bad request",
            Status::CapacityExceeded => "capacity exceeded",
            Status::NotReady => "not ready",
            Status::Internal => "internal error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub op: Op,
    pub response: bool,
    pub status: Status,
    pub request_id: u64,
    pub offset: u64,
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(op: Op, request_id: u64, offset: u64, length: u32, payload: Vec<u8>) -> Self {
        Self {
            op,
            response: false,
            status: Status::Ok,
            request_id,
            offset,
            length,
            payload,
        }
    }

    pub fn handshake(request_id: u64, capacity: u32, config: &[u8]) -> Self {
        Self::request(Op::Handshake, request_id, 0, capacity, config.to_vec())
    }

    pub fn read(request_id: u64, offset: u64, length: u32) -> Self {
        Self::request(Op::Read, request_id, offset, length, Vec::new())
    }

    /// # Panics
    ///
    /// Panics if `data` is longer than `u32::MAX` bytes.
    pub fn write(request_id: u64, offset: u64, data: &[u8]) -> Self {
        let length = u32::try_from(data.len()).expect("write payload fits in u32");
        Self::request(Op::Write, request_id, offset, length, data.to_vec())
    }

    pub fn allocate(request_id: u64, length: u32) -> Self {
        Self::request(Op::Allocate, request_id, 0, length, Vec::new())
    }

    pub fn close(request_id: u64) -> Self {
        Self::request(Op::Close, request_id, 0, 0, Vec::new())
    }

    /// Builds the reply to this request, echoing op, id, offset and length.
    pub fn reply(&self, status: Status, payload: Vec<u8>) -> Self {
        Self {
            op: self.op,
            response: true,
            status,
            request_id: self.request_id,
            offset: self.offset,
            length: self.length,
            payload,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    FrameTooLarge { len: usize, max: usize },
    FrameTooShort { len: usize },
    FrameTruncatedPayload { expected: usize, got: usize },
    FrameTrailingBytes { trailing: usize },

    TruncatedStreamHeader { pending: usize },
    TruncatedStreamPayload { pending: usize, payload_len: usize },

    UnsupportedVersion { version: u8 },
    UnknownOp { op: u8 },
    UnknownStatus { status: u8 },
    InvalidFlags { flags: u8 },
    StatusOnRequest { status: u8 },
    WriteLengthMismatch { length: u32, payload_len: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FrameTooLarge { len, max } => write!(f, "frame too large: {len} > {max}"),
            Error::FrameTooShort { len } => write!(
                f,
                "rdma frame too short: {len} < {RDMA_HEADER_LEN} (truncated header)"
            ),
            Error::FrameTruncatedPayload { expected, got } => write!(
                f,
                "rdma frame truncated payload: expected {expected} bytes, got {got}"
            ),
            Error::FrameTrailingBytes { trailing } => {
                write!(f, "rdma frame has trailing bytes: {trailing}")
            }

            Error::TruncatedStreamHeader { pending } => write!(
                f,
                "truncated rdma frame stream (truncated header: {pending} pending bytes)"
            ),
            Error::TruncatedStreamPayload {
                pending,
                payload_len,
            } => write!(
                f,
                "truncated rdma frame stream (truncated payload: {pending}/{payload_len} payload bytes)"
            ),

            Error::UnsupportedVersion { version } => {
                write!(f, "unsupported rdma protocol version {version}")
            }
            Error::UnknownOp { op } => write!(f, "unknown rdma op {op}"),
            Error::UnknownStatus { status } => write!(f, "unknown rdma status {status}"),
            Error::InvalidFlags { flags } => write!(f, "invalid rdma flags 0x{flags:02x}"),
            Error::StatusOnRequest { status } => {
                write!(f, "rdma request carries non-zero status {status}")
            }
            Error::WriteLengthMismatch {
                length,
                payload_len,
            } => write!(
                f,
                "WRITE length {length} does not match payload length {payload_len}"
            ),
        }
    }
}

impl std::error::Error for Error {}

/// Header fields decoded ahead of the payload.
#[derive(Debug, Clone, Copy)]
struct Header {
    op: Op,
    response: bool,
    status: Status,
    request_id: u64,
    offset: u64,
    length: u32,
    payload_len: usize,
}

impl Header {
    fn into_frame(self, payload: Vec<u8>) -> Result<Frame, Error> {
        if self.op == Op::Write && !self.response && self.length as usize != payload.len() {
            return Err(Error::WriteLengthMismatch {
                length: self.length,
                payload_len: payload.len(),
            });
        }
        Ok(Frame {
            op: self.op,
            response: self.response,
            status: self.status,
            request_id: self.request_id,
            offset: self.offset,
            length: self.length,
            payload,
        })
    }
}

fn parse_header(buf: &[u8; RDMA_HEADER_LEN], limits: &Limits) -> Result<Header, Error> {
    let version = buf[0];
    if version != RDMA_PROTOCOL_VERSION {
        return Err(Error::UnsupportedVersion { version });
    }

    let op = Op::from_u8(buf[1])?;

    let flags = buf[2];
    if flags & !RDMA_FLAG_RESPONSE != 0 {
        return Err(Error::InvalidFlags { flags });
    }
    let response = flags & RDMA_FLAG_RESPONSE != 0;

    let status_raw = buf[3];
    if !response && status_raw != 0 {
        return Err(Error::StatusOnRequest { status: status_raw });
    }
    let status = Status::from_u8(status_raw)?;

    let request_id = u64::from_be_bytes(buf[4..12].try_into().expect("8-byte slice"));
    let offset = u64::from_be_bytes(buf[12..20].try_into().expect("8-byte slice"));
    let length = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
    let payload_len = u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]) as usize;

    if payload_len > limits.max_payload_len {
        return Err(Error::FrameTooLarge {
            len: payload_len,
            max: limits.max_payload_len,
        });
    }

    Ok(Header {
        op,
        response,
        status,
        request_id,
        offset,
        length,
        payload_len,
    })
}

pub fn encode_frame_with_limits(frame: &Frame, limits: &Limits) -> Result<Vec<u8>, Error> {
    let payload = &frame.payload;
    if payload.len() > limits.max_payload_len {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            max: limits.max_payload_len,
        });
    }

    // Length is encoded as u32.
    if payload.len() > u32::MAX as usize {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        });
    }

    if frame.op == Op::Write && !frame.response && frame.length as usize != payload.len() {
        return Err(Error::WriteLengthMismatch {
            length: frame.length,
            payload_len: payload.len(),
        });
    }

    let flags = if frame.response { RDMA_FLAG_RESPONSE } else { 0 };
    let status = if frame.response {
        frame.status.to_u8()
    } else {
        0
    };

    let mut out = Vec::with_capacity(RDMA_HEADER_LEN + payload.len());
    out.push(RDMA_PROTOCOL_VERSION);
    out.push(frame.op.to_u8());
    out.push(flags);
    out.push(status);
    out.extend_from_slice(&frame.request_id.to_be_bytes());
    out.extend_from_slice(&frame.offset.to_be_bytes());
    out.extend_from_slice(&frame.length.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, Error> {
    encode_frame_with_limits(frame, &Limits::default())
}

/// Decodes exactly one frame occupying all of `buf`.
pub fn decode_frame_with_limits(buf: &[u8], limits: &Limits) -> Result<Frame, Error> {
    if buf.len() < RDMA_HEADER_LEN {
        return Err(Error::FrameTooShort { len: buf.len() });
    }

    let header_bytes: &[u8; RDMA_HEADER_LEN] =
        buf[..RDMA_HEADER_LEN].try_into().expect("header-sized slice");
    let header = parse_header(header_bytes, limits)?;

    let expected_total = RDMA_HEADER_LEN + header.payload_len;
    if buf.len() < expected_total {
        return Err(Error::FrameTruncatedPayload {
            expected: expected_total,
            got: buf.len(),
        });
    }
    if buf.len() > expected_total {
        return Err(Error::FrameTrailingBytes {
            trailing: buf.len() - expected_total,
        });
    }

    header.into_frame(buf[RDMA_HEADER_LEN..].to_vec())
}

pub fn decode_frame(buf: &[u8]) -> Result<Frame, Error> {
    decode_frame_with_limits(buf, &Limits::default())
}

/// Streaming parser for `bscomp-rdma-v1` frames.
///
/// The parser is incremental and can accept arbitrary chunk boundaries. It only allocates up to
/// the configured `max_payload_len` per frame. Header validation happens as soon as the header is
/// complete, so a malformed frame is reported before its payload arrives.
#[derive(Debug, Clone)]
pub struct FrameParser {
    limits: Limits,
    state: ParserState,
}

#[derive(Debug, Clone)]
enum ParserState {
    Header {
        buf: [u8; RDMA_HEADER_LEN],
        filled: usize,
    },
    Payload {
        header: Header,
        buf: Vec<u8>,
    },
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits,
            state: ParserState::Header {
                buf: [0u8; RDMA_HEADER_LEN],
                filled: 0,
            },
        }
    }

    pub fn push(&mut self, mut chunk: &[u8]) -> Result<Vec<Frame>, Error> {
        let mut frames = Vec::new();

        while !chunk.is_empty() {
            match &mut self.state {
                ParserState::Header { buf, filled } => {
                    let need = RDMA_HEADER_LEN - *filled;
                    let take = need.min(chunk.len());
                    buf[*filled..*filled + take].copy_from_slice(&chunk[..take]);
                    *filled += take;
                    chunk = &chunk[take..];

                    if *filled < RDMA_HEADER_LEN {
                        continue;
                    }

                    let header = parse_header(buf, &self.limits)?;

                    // Reset header buffer for next time.
                    *filled = 0;

                    if header.payload_len == 0 {
                        frames.push(header.into_frame(Vec::new())?);
                        continue;
                    }

                    self.state = ParserState::Payload {
                        header,
                        buf: Vec::with_capacity(header.payload_len),
                    };
                }
                ParserState::Payload { header, buf } => {
                    let need = header.payload_len.saturating_sub(buf.len());
                    let take = need.min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if buf.len() < header.payload_len {
                        continue;
                    }

                    let payload = core::mem::take(buf);
                    let header = *header;
                    self.state = ParserState::Header {
                        buf: [0u8; RDMA_HEADER_LEN],
                        filled: 0,
                    };
                    frames.push(header.into_frame(payload)?);
                }
            }
        }

        Ok(frames)
    }

    /// Reports an error if the stream ended in the middle of a frame.
    pub fn finish(&self) -> Result<(), Error> {
        match &self.state {
            ParserState::Header { filled, .. } => {
                if *filled == 0 {
                    Ok(())
                } else {
                    Err(Error::TruncatedStreamHeader { pending: *filled })
                }
            }
            ParserState::Payload { header, buf } => Err(Error::TruncatedStreamPayload {
                pending: buf.len(),
                payload_len: header.payload_len,
            }),
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}
