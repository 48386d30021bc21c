//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! A frame is the atomic unit on the wire:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Data frames ([`OpCode::Text`], [`OpCode::Binary`], [`OpCode::Continuation`])
//! carry application payload; control frames ([`OpCode::Close`],
//! [`OpCode::Ping`], [`OpCode::Pong`]) manage the connection and must arrive
//! unfragmented with at most 125 payload bytes.
//!
//! RSV1 marks a permessage-deflate compressed payload (RFC 7692); RSV2 and
//! RSV3 must be zero.
use bytes::BytesMut;

use crate::{close::CloseCode, WebSocketError};

/// Operation code of a frame, from
/// [RFC 6455 Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
///
/// Values 0x3-0x7 and 0xB-0xF are reserved and rejected during decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames must not be fragmented and carry at most 125 payload
    /// bytes; the decoder enforces both.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Largest possible frame header: 2 fixed bytes, 8 extended-length bytes and
/// a 4-byte masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// A single WebSocket frame.
///
/// Most applications never touch frames directly; the connection engine
/// assembles them into messages and hands payloads to callbacks. The type is
/// public for tests and for callers that need wire-level control.
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// RSV1: payload is (or is to be) compressed with permessage-deflate.
    pub(crate) is_compressed: bool,
    /// Masking key, present on frames received from a client.
    pub(crate) mask: Option<[u8; 4]>,
    /// Payload bytes. Unmasked and decompressed once decoding finishes.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a frame from its parts. The payload is taken as-is.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
            is_compressed: false,
        }
    }

    /// Creates a frame whose payload has already been run through the
    /// deflate compressor; the encoder will set RSV1.
    pub(crate) fn compressed(fin: bool, opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin,
            opcode,
            mask: None,
            payload: payload.into(),
            is_compressed: true,
        }
    }

    /// Final text frame with the given payload.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, None, payload.as_ref())
    }

    /// Final binary frame with the given payload.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, None, payload.as_ref())
    }

    /// Ping frame. The payload must not exceed 125 bytes; the send path
    /// checks this.
    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, None, payload.as_ref())
    }

    /// Pong frame.
    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, None, payload.as_ref())
    }

    /// Close frame carrying `code` in big-endian followed by the UTF-8
    /// `reason` bytes.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Close frame with a raw payload; no code/reason structure is imposed.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, None, payload.as_ref())
    }

    /// Status code of a close frame, if the payload carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let bytes = self.payload.get(0..2)?;
        Some(CloseCode::from(u16::from_be_bytes([bytes[0], bytes[1]])))
    }

    /// Reason string of a close frame, if present and valid UTF-8.
    pub fn close_reason(&self) -> Option<&str> {
        std::str::from_utf8(self.payload.get(2..)?).ok()
    }

    /// Removes the masking from the payload using the stored key.
    pub(crate) fn unmask(&mut self) {
        if let Some(mask) = self.mask.take() {
            crate::mask::apply_mask(&mut self.payload, mask);
        }
    }

    /// Serializes the frame header into `head` and returns its length.
    ///
    /// The length field uses the minimal encoding: 0-125 inline, 126-65535
    /// in 16 bits, anything larger in 64 bits. A masking key, when present,
    /// follows the length.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        let compression = u8::from(self.is_compressed);
        head[0] = (self.fin as u8) << 7 | compression << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_is_control() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());

        assert!(!OpCode::Continuation.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
    }

    #[test]
    fn test_opcode_byte_conversions() {
        for byte in [0x0u8, 0x1, 0x2, 0x8, 0x9, 0xA] {
            let opcode = OpCode::try_from(byte).unwrap();
            assert_eq!(u8::from(opcode), byte);
        }
        for byte in [0x3u8, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(OpCode::try_from(byte).is_err());
        }
    }

    #[test]
    fn test_close_frame_layout() {
        let frame = Frame::close(CloseCode::Normal, "done");
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(&frame.payload[..2], &[0x03, 0xE8]);
        assert_eq!(&frame.payload[2..], b"done");
        assert_eq!(frame.close_code(), Some(CloseCode::Normal));
        assert_eq!(frame.close_reason(), Some("done"));
    }

    #[test]
    fn test_close_code_on_short_payload() {
        let frame = Frame::close_raw(b"");
        assert_eq!(frame.close_code(), None);
        assert_eq!(frame.close_reason(), None);
    }

    #[test]
    fn test_unmask() {
        let mut frame = Frame::new(
            true,
            OpCode::Text,
            Some([0x37, 0xfa, 0x21, 0x3d]),
            &[0x7f, 0x9f, 0x4d, 0x51, 0x58][..],
        );
        frame.unmask();
        assert_eq!(&frame.payload[..], b"Hello");
        assert!(frame.mask.is_none());
    }

    #[test]
    fn test_head_small_payload() {
        let frame = Frame::text("Hello!");
        let mut head = [0u8; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        assert_eq!(size, 2);
        assert_eq!(head[0], 0x81); // FIN=1, RSV=0, opcode=text
        assert_eq!(head[1], 6); // MASK=0, length inline
    }

    // Header length selection at the encoding boundaries: 125 stays inline,
    // 126 and 65535 use the 16-bit form, 65536 the 64-bit form.
    #[test]
    fn test_head_length_boundaries() {
        let cases: &[(usize, usize, u8)] = &[
            (125, 2, 125),
            (126, 4, 126),
            (127, 4, 126),
            (65535, 4, 126),
            (65536, 10, 127),
        ];
        for &(len, head_size, length_code) in cases {
            let frame = Frame::binary(vec![0u8; len]);
            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head);
            assert_eq!(size, head_size, "payload len {len}");
            assert_eq!(head[1] & 0x7F, length_code, "payload len {len}");
        }

        let frame = Frame::binary(vec![0u8; 65535]);
        let mut head = [0u8; MAX_HEAD_SIZE];
        frame.fmt_head(&mut head);
        assert_eq!(&head[2..4], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_head_mask_bit() {
        let key = [0xAA, 0xBB, 0xCC, 0xDD];
        let frame = Frame::new(true, OpCode::Text, Some(key), &b"Header test"[..]);

        let mut head = [0u8; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        assert_eq!(size, 2 + 4);
        assert_eq!(head[1], 0x80 | 11);
        assert_eq!(&head[2..6], &key);
    }

    #[test]
    fn test_compressed_head_sets_rsv1() {
        let frame = Frame::compressed(true, OpCode::Text, &b"x"[..]);
        let mut head = [0u8; MAX_HEAD_SIZE];
        frame.fmt_head(&mut head);
        assert_eq!(head[0], 0xC1); // FIN=1, RSV1=1, opcode=text
    }
}
