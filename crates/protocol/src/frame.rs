//! WebSocket frame codec (RFC 6455 Section 5.2)
//!
//! Decoding works on a single read buffer: one call yields at most one
//! frame and nothing is carried over between reads. Frames spanning
//! several reads are reported as [`FrameError::Incomplete`].

use bytes::Bytes;
use thiserror::Error;

use crate::mask::MaskKey;

/// FIN bit of byte 0
pub const FIN_BIT: u8 = 0x80;

/// RSV1 bit of byte 0, marks a compressed payload
pub const RSV1_BIT: u8 = 0x40;

/// MASK bit of byte 1
pub const MASK_BIT: u8 = 0x80;

/// Largest length carried in the 7-bit field
pub const MAX_SHORT_LEN: usize = 125;

/// Marker for a 16-bit extended length
pub const LEN_16_MARKER: u8 = 126;

/// Marker for a 64-bit extended length
pub const LEN_64_MARKER: u8 = 127;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("Unknown opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(u64),
}

/// Frame opcodes (RFC 6455 Section 11.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parse the low 4 bits of byte 0
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & 0x0F {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    /// Text or binary
    pub fn is_data(self) -> bool {
        matches!(self, Opcode::Text | Opcode::Binary)
    }
}

/// Close status codes (RFC 6455 Section 7.4.1)
pub mod close_code {
    pub const NORMAL_CLOSURE: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const NO_STATUS_RECEIVED: u16 = 1005;
    pub const ABNORMAL_CLOSURE: u16 = 1006;
    pub const INVALID_FRAME_PAYLOAD_DATA: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL_SERVER_ERR: u16 = 1011;
    pub const SERVICE_RESTART: u16 = 1012;
    pub const TRY_AGAIN_LATER: u16 = 1013;
    pub const TLS_HANDSHAKE: u16 = 1015;
}

/// A decoded, unmasked client frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// RSV1: payload is deflate-compressed
    pub compressed: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Close code and reason carried by a close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: Bytes,
}

impl CloseInfo {
    /// Split a close payload into its big-endian code and reason bytes.
    /// A payload shorter than two bytes carries no status.
    pub fn parse(payload: &Bytes) -> Self {
        if payload.len() < 2 {
            return Self {
                code: close_code::NO_STATUS_RECEIVED,
                reason: Bytes::new(),
            };
        }

        Self {
            code: u16::from_be_bytes([payload[0], payload[1]]),
            reason: payload.slice(2..),
        }
    }
}

impl Frame {
    /// Decode one frame from the start of `buf`.
    ///
    /// Returns `Ok(None)` when the mask bit is clear: client frames must be
    /// masked and unmasked ones are dropped without tearing the connection down.
    pub fn decode(buf: &[u8]) -> Result<Option<Frame>, FrameError> {
        if buf.len() < 2 {
            return Err(FrameError::Incomplete {
                needed: 2,
                available: buf.len(),
            });
        }

        let fin = buf[0] & FIN_BIT != 0;
        let compressed = buf[0] & RSV1_BIT != 0;
        let opcode_bits = buf[0] & 0x0F;

        if buf[1] & MASK_BIT == 0 {
            return Ok(None);
        }

        let opcode = Opcode::from_u8(opcode_bits).ok_or(FrameError::UnknownOpcode(opcode_bits))?;

        let (payload_len, mask_start) = match buf[1] & 0x7F {
            LEN_16_MARKER => {
                let len = read_be::<2>(buf, 2)?;
                (u16::from_be_bytes(len) as u64, 4)
            }
            LEN_64_MARKER => {
                let len = read_be::<8>(buf, 2)?;
                (u64::from_be_bytes(len), 10)
            }
            short => (short as u64, 2),
        };

        let payload_len =
            usize::try_from(payload_len).map_err(|_| FrameError::PayloadTooLarge(payload_len))?;

        let mask = read_be::<4>(buf, mask_start)?;
        let data_start = mask_start + 4;
        let data_end = data_start
            .checked_add(payload_len)
            .ok_or(FrameError::PayloadTooLarge(payload_len as u64))?;

        if buf.len() < data_end {
            return Err(FrameError::Incomplete {
                needed: data_end,
                available: buf.len(),
            });
        }

        let mut payload = buf[data_start..data_end].to_vec();
        MaskKey::new(mask).apply_inplace(&mut payload);

        Ok(Some(Frame {
            fin,
            compressed,
            opcode,
            payload: Bytes::from(payload),
        }))
    }
}

fn read_be<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N], FrameError> {
    buf.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(FrameError::Incomplete {
            needed: at + N,
            available: buf.len(),
        })
}

/// Append the length field for a `len`-byte payload (mask bit OR-ed into byte 1)
fn put_len(out: &mut Vec<u8>, len: usize, mask_bit: u8) {
    if len <= MAX_SHORT_LEN {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | LEN_16_MARKER);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | LEN_64_MARKER);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Total wire length of the frame starting at `buf[0]`, header included.
///
/// `None` until the whole header (length fields and mask) is in `buf`.
/// Works for unmasked frames too.
pub fn frame_len(buf: &[u8]) -> Option<u64> {
    let second = *buf.get(1)?;
    let mask_len = if second & MASK_BIT != 0 { 4 } else { 0 };

    let (payload_len, len_end) = match second & 0x7F {
        LEN_16_MARKER => (u16::from_be_bytes(read_be::<2>(buf, 2).ok()?) as u64, 4),
        LEN_64_MARKER => (u64::from_be_bytes(read_be::<8>(buf, 2).ok()?), 10),
        short => (short as u64, 2),
    };

    let header_len = len_end + mask_len;
    if buf.len() < header_len {
        return None;
    }
    payload_len.checked_add(header_len as u64)
}

/// Bytes by which the frames in `buf` run past its end.
///
/// Walks frame boundaries from the start of `buf`. `Some(0)` means `buf`
/// ends exactly on a boundary; `None` means it ends inside a frame header,
/// so the overrun cannot be known.
pub fn spilled_len(buf: &[u8]) -> Option<u64> {
    let mut pos = 0usize;
    while pos < buf.len() {
        let len = frame_len(&buf[pos..])?;
        let remaining = (buf.len() - pos) as u64;
        if len > remaining {
            return Some(len - remaining);
        }
        // len <= remaining, so it fits in usize
        pos += len as usize;
    }
    Some(0)
}

/// Encode a final, unmasked server frame into `out`.
///
/// `compressed` sets RSV1; the payload must already be deflated.
pub fn encode_frame(out: &mut Vec<u8>, opcode: Opcode, payload: &[u8], compressed: bool) {
    let mut first = FIN_BIT | opcode as u8;
    if compressed {
        first |= RSV1_BIT;
    }

    out.reserve(payload.len() + 10);
    out.push(first);
    put_len(out, payload.len(), 0);
    out.extend_from_slice(payload);
}

/// Encode a final, masked client frame into `out`
pub fn encode_masked_frame(out: &mut Vec<u8>, opcode: Opcode, payload: &[u8], key: MaskKey) {
    out.reserve(payload.len() + 14);
    out.push(FIN_BIT | opcode as u8);
    put_len(out, payload.len(), MASK_BIT);
    out.extend_from_slice(&key.bytes());

    let start = out.len();
    out.extend_from_slice(payload);
    key.apply_inplace(&mut out[start..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn masked(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_masked_frame(&mut out, opcode, payload, MaskKey::new(KEY));
        out
    }

    #[test]
    fn test_decode_rfc_masked_hello() {
        // RFC 6455 Section 5.7
        let wire = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let frame = Frame::decode(&wire).unwrap().unwrap();

        assert!(frame.fin);
        assert!(!frame.compressed);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn test_unmasked_frame_discarded() {
        let wire = [0x81, 0x05, b'H', b'e', b'l', b'l', b'o'];
        assert_eq!(Frame::decode(&wire), Ok(None));
    }

    #[test]
    fn test_decode_16bit_length() {
        let payload = vec![0xABu8; 200];
        let wire = masked(Opcode::Binary, &payload);
        assert_eq!(wire[1], MASK_BIT | LEN_16_MARKER);

        let frame = Frame::decode(&wire).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn test_decode_64bit_length() {
        let payload = vec![0xCDu8; 300];
        let mut wire = vec![0x82, MASK_BIT | LEN_64_MARKER];
        wire.extend_from_slice(&300u64.to_be_bytes());
        wire.extend_from_slice(&[0, 0, 0, 0]);
        wire.extend_from_slice(&payload);

        let frame = Frame::decode(&wire).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn test_close_frame_metadata() {
        let mut payload = 1001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let frame = Frame::decode(&masked(Opcode::Close, &payload)).unwrap().unwrap();

        assert_eq!(frame.opcode, Opcode::Close);
        let info = CloseInfo::parse(&frame.payload);
        assert_eq!(info.code, close_code::GOING_AWAY);
        assert_eq!(&info.reason[..], b"bye");
    }

    #[test]
    fn test_close_without_status() {
        let info = CloseInfo::parse(&Bytes::new());
        assert_eq!(info.code, close_code::NO_STATUS_RECEIVED);
        assert!(info.reason.is_empty());
    }

    #[test]
    fn test_truncated_frame() {
        let wire = masked(Opcode::Text, b"truncated payload");
        let result = Frame::decode(&wire[..wire.len() - 3]);
        assert!(matches!(result, Err(FrameError::Incomplete { .. })));

        assert!(matches!(
            Frame::decode(&[0x81]),
            Err(FrameError::Incomplete { needed: 2, available: 1 })
        ));
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(frame_len(&masked(Opcode::Text, b"hello")), Some(11));
        assert_eq!(frame_len(&masked(Opcode::Text, &[0u8; 300])), Some(308));
        assert_eq!(frame_len(&[0x81, 0x02, b'h', b'i']), Some(4));

        // Header cut inside the extended length or the mask
        let wire = masked(Opcode::Binary, &[0u8; 70_000]);
        assert_eq!(frame_len(&wire[..5]), None);
        assert_eq!(frame_len(&wire[..13]), None);
        assert_eq!(frame_len(&wire[..14]), Some(70_014));
        assert_eq!(frame_len(&[0x81]), None);
    }

    #[test]
    fn test_spilled_len() {
        let big = masked(Opcode::Text, &[b'a'; 2000]);
        assert_eq!(spilled_len(&big[..1024]), Some(2008 - 1024));
        assert_eq!(spilled_len(&big), Some(0));

        // Second frame is cut short
        let mut wire = masked(Opcode::Text, b"first");
        let second = masked(Opcode::Text, &[b'b'; 200]);
        wire.extend_from_slice(&second[..50]);
        assert_eq!(spilled_len(&wire), Some(second.len() as u64 - 50));

        // Ends one byte into the next header
        let mut wire = masked(Opcode::Text, b"first");
        wire.push(0x81);
        assert_eq!(spilled_len(&wire), None);
    }

    #[test]
    fn test_unknown_opcode() {
        let wire = [0x83, 0x80, 0, 0, 0, 0];
        assert_eq!(Frame::decode(&wire), Err(FrameError::UnknownOpcode(0x3)));
    }

    #[test]
    fn test_rsv1_marks_compressed() {
        let mut wire = masked(Opcode::Text, b"x");
        wire[0] |= RSV1_BIT;
        assert!(Frame::decode(&wire).unwrap().unwrap().compressed);
    }

    #[test]
    fn test_encode_125_single_length_byte() {
        let mut out = Vec::new();
        encode_frame(&mut out, Opcode::Text, &[7u8; 125], false);

        assert_eq!(out[0], 0x81);
        assert_eq!(out[1], 125);
        assert_eq!(out.len(), 2 + 125);
    }

    #[test]
    fn test_encode_126_extended_length() {
        let mut out = Vec::new();
        encode_frame(&mut out, Opcode::Text, &[7u8; 126], false);

        assert_eq!(out[1], LEN_16_MARKER);
        assert_eq!(&out[2..4], &126u16.to_be_bytes());
        assert_eq!(out.len(), 4 + 126);
    }

    #[test]
    fn test_encode_compressed_sets_rsv1() {
        let mut out = Vec::new();
        encode_frame(&mut out, Opcode::Text, b"z", true);
        assert_eq!(out[0], 0x81 + 0x40);
    }

    #[test]
    fn test_encode_64bit_length() {
        let payload = vec![1u8; 70_000];
        let mut out = Vec::new();
        encode_frame(&mut out, Opcode::Binary, &payload, false);

        assert_eq!(out[1], LEN_64_MARKER);
        assert_eq!(&out[2..10], &70_000u64.to_be_bytes());
        assert_eq!(out.len(), 10 + 70_000);
    }

    #[test]
    fn test_65534_bytes_roundtrip() {
        let payload: Vec<u8> = (0..65534u32).map(|i| (i % 253) as u8).collect();

        let mut server = Vec::new();
        encode_frame(&mut server, Opcode::Binary, &payload, false);
        assert_eq!(server[1], LEN_16_MARKER);
        assert_eq!(&server[2..4], &65534u16.to_be_bytes());
        assert_eq!(&server[4..], &payload[..]);

        let frame = Frame::decode(&masked(Opcode::Binary, &payload)).unwrap().unwrap();
        assert_eq!(&frame.payload[..], &payload[..]);
    }
}
