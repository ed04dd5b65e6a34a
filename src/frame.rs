//! WebSocket frame codec (RFC 6455 Section 5).
//!
//! Wire format:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |Masking-key, if MASK set to 1  |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! The codec is role-aware: the server role rejects unmasked client frames
//! and never masks what it sends; the client role does the opposite (kept so
//! tests and tooling can speak the browser side of the wire).

use crate::codec::{Decoder, Encoder};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
}

impl Opcode {
    /// Returns true for Close, Ping and Pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Parse an opcode from its wire value.
    pub fn from_u8(value: u8) -> Result<Self, WsError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WsError::InvalidOpcode(other)),
        }
    }
}

/// A single decoded (or to-be-encoded) frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Final-fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Payload bytes, already unmasked.
    pub payload: Bytes,
}

impl Frame {
    /// A final text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    /// A final binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    /// A pong frame carrying `payload` (usually a ping's payload echoed back).
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            payload: payload.into(),
        }
    }

    /// A close frame echoing a raw close payload.
    ///
    /// A one-byte payload cannot carry a valid status code; it is replaced
    /// with an empty payload so the reply stays well-formed.
    #[must_use]
    pub fn close_echo(payload: Bytes) -> Self {
        let payload = if payload.len() == 1 { Bytes::new() } else { payload };
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload,
        }
    }
}

/// Frame codec errors.
#[derive(Debug)]
pub enum WsError {
    /// I/O error while reading or writing frames.
    Io(io::Error),
    /// Unknown opcode value on the wire.
    InvalidOpcode(u8),
    /// Reserved header bits set without a negotiated extension.
    ReservedBitsSet,
    /// Payload larger than the configured maximum.
    PayloadTooLarge {
        /// Announced payload size.
        size: u64,
        /// Configured maximum.
        max: usize,
    },
    /// Control frame payload above the 125-byte limit.
    ControlFrameTooLarge(usize),
    /// Control frame with the FIN bit clear.
    FragmentedControlFrame,
    /// Client-to-server frame arrived unmasked.
    UnmaskedClientFrame,
    /// Server-to-client frame arrived masked.
    MaskedServerFrame,
    /// Fragmentation sequence violated (stray or missing continuation).
    FragmentSequence,
}

impl std::fmt::Display for WsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::InvalidOpcode(op) => write!(f, "invalid opcode: 0x{op:X}"),
            Self::ReservedBitsSet => write!(f, "reserved bits set without extension"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "payload too large: {size} bytes (max: {max})")
            }
            Self::ControlFrameTooLarge(size) => {
                write!(f, "control frame payload too large: {size} bytes (max: 125)")
            }
            Self::FragmentedControlFrame => write!(f, "control frame cannot be fragmented"),
            Self::UnmaskedClientFrame => write!(f, "client frame must be masked"),
            Self::MaskedServerFrame => write!(f, "server frame should not be masked"),
            Self::FragmentSequence => write!(f, "invalid fragmentation sequence"),
        }
    }
}

impl std::error::Error for WsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WsError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Connection role; decides the masking rules each side enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Masks outbound frames; rejects masked inbound frames.
    Client,
    /// Rejects unmasked inbound frames; never masks outbound frames.
    Server,
}

/// Fixed header fields carried between decode states.
#[derive(Debug, Clone, Copy)]
struct PartialHeader {
    fin: bool,
    opcode: Opcode,
    masked: bool,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    ExtendedLength { head: PartialHeader, width: usize },
    MaskKey { head: PartialHeader, payload_len: u64 },
    Payload { head: PartialHeader, mask_key: Option<[u8; 4]>, payload_len: u64 },
}

/// Stateful frame codec; one per connection.
#[derive(Debug)]
pub struct FrameCodec {
    max_payload_size: usize,
    role: Role,
    state: DecodeState,
}

impl FrameCodec {
    /// Default per-frame payload ceiling (16 MB).
    pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

    /// Create a codec for the given role.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            max_payload_size: Self::DEFAULT_MAX_PAYLOAD_SIZE,
            role,
            state: DecodeState::Header,
        }
    }

    /// Server-role codec.
    #[must_use]
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Client-role codec.
    #[must_use]
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Override the per-frame payload ceiling.
    #[must_use]
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    fn check_len(&mut self, payload_len: u64) -> Result<(), WsError> {
        if payload_len > self.max_payload_size as u64 {
            self.state = DecodeState::Header;
            return Err(WsError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload_size,
            });
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WsError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let first = src[0];
                    let second = src[1];

                    let fin = first & 0x80 != 0;
                    if first & 0x70 != 0 {
                        return Err(WsError::ReservedBitsSet);
                    }
                    let opcode = Opcode::from_u8(first & 0x0F)?;
                    let masked = second & 0x80 != 0;
                    let len7 = second & 0x7F;

                    match self.role {
                        Role::Server if !masked => return Err(WsError::UnmaskedClientFrame),
                        Role::Client if masked => return Err(WsError::MaskedServerFrame),
                        _ => {}
                    }

                    if opcode.is_control() {
                        if !fin {
                            return Err(WsError::FragmentedControlFrame);
                        }
                        if len7 > 125 {
                            return Err(WsError::ControlFrameTooLarge(len7 as usize));
                        }
                    }

                    let _ = src.split_to(2);
                    let head = PartialHeader { fin, opcode, masked };

                    match len7 {
                        0..=125 => {
                            let payload_len = u64::from(len7);
                            self.check_len(payload_len)?;
                            self.state = if masked {
                                DecodeState::MaskKey { head, payload_len }
                            } else {
                                DecodeState::Payload { head, mask_key: None, payload_len }
                            };
                        }
                        126 => self.state = DecodeState::ExtendedLength { head, width: 2 },
                        127 => self.state = DecodeState::ExtendedLength { head, width: 8 },
                        _ => unreachable!(),
                    }
                }

                DecodeState::ExtendedLength { head, width } => {
                    if src.len() < width {
                        return Ok(None);
                    }
                    let bytes = src.split_to(width);
                    let payload_len = if width == 2 {
                        u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))
                    } else {
                        u64::from_be_bytes([
                            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6],
                            bytes[7],
                        ])
                    };
                    self.check_len(payload_len)?;
                    self.state = if head.masked {
                        DecodeState::MaskKey { head, payload_len }
                    } else {
                        DecodeState::Payload { head, mask_key: None, payload_len }
                    };
                }

                DecodeState::MaskKey { head, payload_len } => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let bytes = src.split_to(4);
                    let mut mask_key = [0u8; 4];
                    mask_key.copy_from_slice(&bytes);
                    self.state = DecodeState::Payload { head, mask_key: Some(mask_key), payload_len };
                }

                DecodeState::Payload { head, mask_key, payload_len } => {
                    let wanted = payload_len as usize;
                    if src.len() < wanted {
                        return Ok(None);
                    }
                    let mut payload = src.split_to(wanted);
                    if let Some(key) = mask_key {
                        apply_mask(&mut payload, key);
                    }
                    self.state = DecodeState::Header;
                    return Ok(Some(Frame {
                        fin: head.fin,
                        opcode: head.opcode,
                        payload: payload.freeze(),
                    }));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WsError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WsError> {
        let payload_len = frame.payload.len();

        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(WsError::FragmentedControlFrame);
            }
            if payload_len > 125 {
                return Err(WsError::ControlFrameTooLarge(payload_len));
            }
        }

        let should_mask = self.role == Role::Client;
        let mask_bit = if should_mask { 0x80 } else { 0 };

        dst.reserve(SERVER_HEADER_MAX + 4 + payload_len);

        let mut first = frame.opcode as u8;
        if frame.fin {
            first |= 0x80;
        }
        dst.put_u8(first);

        if payload_len <= 125 {
            dst.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(payload_len as u64);
        }

        if should_mask {
            let mask_key = derive_mask_key(&frame.payload);
            dst.put_slice(&mask_key);
            let mut masked = BytesMut::from(frame.payload.as_ref());
            apply_mask(&mut masked, mask_key);
            dst.put_slice(&masked);
        } else {
            dst.put_slice(&frame.payload);
        }

        Ok(())
    }
}

/// Largest server-role frame header: 2 fixed bytes plus a 64-bit length.
pub const SERVER_HEADER_MAX: usize = 10;

/// Write an unmasked server-role header for a final frame into `out`.
///
/// Returns the number of header bytes written, at most
/// [`SERVER_HEADER_MAX`]. Used by the padded-write path to place the header
/// immediately in front of a payload that is already in its final position.
#[must_use]
pub fn encode_server_header(opcode: Opcode, payload_len: usize, out: &mut [u8; SERVER_HEADER_MAX]) -> usize {
    out[0] = 0x80 | opcode as u8;
    if payload_len <= 125 {
        out[1] = payload_len as u8;
        2
    } else if payload_len <= 65535 {
        out[1] = 126;
        out[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        4
    } else {
        out[1] = 127;
        out[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
        10
    }
}

/// XOR `data` in place with the 4-byte mask key. Involutive.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Derive a mask key for client-role encoding.
///
/// Masking exists to defeat proxy cache poisoning, not for secrecy; a key
/// mixed from the payload is sufficient for the test-client role this crate
/// keeps the encoder around for.
fn derive_mask_key(payload: &[u8]) -> [u8; 4] {
    let mut key = [0x5A, 0xC3, 0x3C, 0xA5];
    for (i, b) in payload.iter().take(16).enumerate() {
        key[i % 4] ^= b.wrapping_mul(31).wrapping_add(i as u8);
    }
    key
}
