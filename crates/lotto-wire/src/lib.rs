// Simple wire format for framing lotto messages on a TCP stream.
use bytes::{Buf, BufMut, Bytes, BytesMut};

mod message;

pub use message::{
    Bet, Reply, ReplyKind, Request, SEPARATOR, batch_encoded_len, batch_header_len, parse_number,
    tags,
};

/// Hard cap for a single frame payload. Agencies and the central server must
/// agree on this value since it is enforced on both the read and write paths.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid frame length {length} (cap {max})")]
    InvalidFrameLength { length: u32, max: usize },
    #[error("payload too large: {len} bytes (cap {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("empty payload")]
    EmptyPayload,
    #[error("incomplete frame")]
    Incomplete,
    #[error("field {field} contains a reserved character")]
    InvalidField { field: &'static str },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply { expected: ReplyKind, got: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 4;

    pub fn new(length: u32) -> Self {
        Self { length }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.length);
    }

    pub fn encode_into(&self, out: &mut [u8; Self::LEN]) {
        *out = self.length.to_be_bytes();
    }

    /// Decodes and bounds-checks a header. The body must never be read when
    /// this fails.
    pub fn decode(mut buf: &[u8], max_frame_bytes: usize) -> Result<Self> {
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let length = buf.get_u32();
        if length == 0 || length as usize > max_frame_bytes {
            return Err(Error::InvalidFrameLength {
                length,
                max: max_frame_bytes,
            });
        }
        Ok(Self { length })
    }
}

/// Frame containing a header and a non-empty payload.
///
/// ```
/// use bytes::Bytes;
/// use lotto_wire::{DEFAULT_MAX_FRAME_BYTES, Frame};
///
/// let frame = Frame::new(Bytes::from_static(b"DONE|1\n"), DEFAULT_MAX_FRAME_BYTES).expect("frame");
/// let encoded = frame.encode();
/// assert_eq!(&encoded[..4], &[0, 0, 0, 7]);
/// let decoded = Frame::decode(encoded, DEFAULT_MAX_FRAME_BYTES).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"DONE|1\n"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: Bytes, max_frame_bytes: usize) -> Result<Self> {
        check_payload_len(payload.len(), max_frame_bytes)?;
        Ok(Self {
            header: FrameHeader::new(payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes, max_frame_bytes: usize) -> Result<Self> {
        let header = FrameHeader::decode(&input, max_frame_bytes)?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Validates a payload length against the frame invariant `0 < len <= max`.
pub fn check_payload_len(len: usize, max_frame_bytes: usize) -> Result<()> {
    if len == 0 {
        return Err(Error::EmptyPayload);
    }
    // The u32 prefix bounds the cap even when a caller configures more.
    if len > max_frame_bytes || len > u32::MAX as usize {
        return Err(Error::PayloadTooLarge {
            len,
            max: max_frame_bytes,
        });
    }
    Ok(())
}
