//! Frame codec: bytes to [`Frame`] and back.
//!
//! [`FrameDecoder`] and [`FrameEncoder`] implement the
//! [`tokio_util::codec`] traits, so a `FramedRead` accumulates partial
//! frames across socket reads and pipelined frames in one read are decoded
//! back to back. The decoder also owns the inbound half of
//! permessage-deflate: a frame arriving with RSV1 set leaves the decoder
//! with its payload already inflated.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    compression::Decompressor,
    frame::{self, Frame, MAX_HEAD_SIZE},
    OpCode, WebSocketError,
};

/// Decoding progress for one frame.
enum ReadState {
    /// Fixed two bytes read; waiting for the extended length and mask key.
    Header(Header),
    /// Full header read; waiting for the payload.
    Payload(HeaderAndMask),
}

/// Fields of the fixed header plus derived sizes.
struct Header {
    fin: bool,
    /// RSV1, the compression bit.
    rsv1: bool,
    masked: bool,
    opcode: OpCode,
    /// Bytes of extended length still to read (0, 2 or 8).
    extra: usize,
    /// The raw 7-bit length field.
    length_code: u8,
    /// extra + mask key size.
    header_size: usize,
}

/// Header fields and mask once the full header is available.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Streaming WebSocket frame decoder.
///
/// The decoder carries its progress between calls, so it can be driven with
/// however many bytes the socket yields. Protocol violations (reserved
/// bits, bad opcodes, fragmented control frames, unmasked client frames,
/// oversized payloads) surface as [`WebSocketError`]s.
pub struct FrameDecoder {
    state: Option<ReadState>,
    /// Largest accepted payload for a single frame.
    max_payload_size: usize,
    /// Reject frames that arrive without a mask. Servers set this: RFC 6455
    /// requires clients to mask every frame.
    require_mask: bool,
    /// Present when permessage-deflate was negotiated.
    inflate: Option<Decompressor>,
}

impl FrameDecoder {
    /// A lenient decoder: masking optional, compression off.
    ///
    /// Suitable for reading server-emitted frames, e.g. in tests.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            state: None,
            max_payload_size,
            require_mask: false,
            inflate: None,
        }
    }

    /// A lenient decoder that also inflates RSV1 payloads.
    ///
    /// Suitable for reading compressed server-emitted frames.
    pub fn with_compression(max_payload_size: usize) -> Self {
        Self {
            state: None,
            max_payload_size,
            require_mask: false,
            inflate: Some(Decompressor::new()),
        }
    }

    /// The decoder for an accepted connection: client frames must be
    /// masked, and RSV1 payloads are inflated when `compression` was
    /// negotiated.
    pub(crate) fn server(max_payload_size: usize, compression: bool) -> Self {
        Self {
            state: None,
            max_payload_size,
            require_mask: true,
            inflate: compression.then(Decompressor::new),
        }
    }

    /// Decompresses an RSV1 payload in place, clearing the compression bit.
    ///
    /// A payload of exactly one zero byte is an empty DEFLATE block and
    /// yields an empty payload.
    fn inflate_frame(&mut self, frame: &mut Frame) -> Result<(), WebSocketError> {
        let inflate = self
            .inflate
            .as_mut()
            .ok_or(WebSocketError::CompressionNotSupported)?;

        frame.is_compressed = false;
        if frame.payload.is_empty() || frame.payload[..] == [0x00] {
            frame.payload.clear();
            return Ok(());
        }

        let payload = inflate.decompress(&frame.payload)?;
        if payload.len() > self.max_payload_size {
            return Err(WebSocketError::FrameTooLarge);
        }
        frame.payload = payload;
        Ok(())
    }
}

impl codec::Decoder for FrameDecoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes the next frame out of `src`, or returns `Ok(None)` when more
    /// bytes are needed.
    ///
    /// The decode happens in stages (fixed header, extended header,
    /// payload); partially consumed stages are remembered across calls, so
    /// a frame split over any number of reads decodes once its last byte
    /// arrives.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b10000000 != 0;
                    let rsv1 = src[0] & 0b01000000 != 0;

                    if src[0] & 0b00110000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = frame::OpCode::try_from(src[0] & 0b00001111)?;
                    let masked = src[1] & 0b10000000 != 0;
                    let length_code = src[1] & 0x7F;

                    if self.require_mask && !masked {
                        return Err(WebSocketError::UnmaskedFrame);
                    }
                    if opcode.is_control() && !fin {
                        return Err(WebSocketError::ControlFrameFragmented);
                    }
                    if opcode.is_control() && length_code > 125 {
                        return Err(WebSocketError::ControlFrameTooLarge);
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv1,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        #[cfg(target_pointer_width = "64")]
                        8 => src.get_u64() as usize,
                        #[cfg(any(target_pointer_width = "16", target_pointer_width = "32"))]
                        8 => match usize::try_from(src.get_u64()) {
                            Ok(length) => length,
                            Err(_) => return Err(WebSocketError::PayloadLengthUnsupported),
                        },
                        _ => unreachable!(),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let header = header_and_mask.header;
                    let mask = header_and_mask.mask;
                    let payload = src.split_to(header_and_mask.payload_len);

                    let mut frame = Frame::new(header.fin, header.opcode, mask, payload);
                    frame.unmask();
                    if header.rsv1 {
                        frame.is_compressed = true;
                        self.inflate_frame(&mut frame)?;
                    }

                    break Ok(Some(frame));
                }
            }
        }
    }

    /// Called when the transport reaches EOF.
    ///
    /// A clean end of stream between frames is fine; bytes of a partial
    /// frame left behind mean the peer vanished mid-frame.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if self.state.is_none() && src.is_empty() => Ok(None),
            None => Err(WebSocketError::IncompleteFrame),
        }
    }
}

/// WebSocket frame encoder.
///
/// Serializes the header with minimal length encoding and appends the
/// payload. Frames pass through untouched otherwise; the send path decides
/// about compression before a frame reaches the encoder, and server frames
/// never carry a mask.
pub struct FrameEncoder;

impl codec::Encoder<Frame> for FrameEncoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compressor;
    use tokio_util::codec::{Decoder, Encoder};

    fn decode_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).expect("decode") {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decode_unmasked_text() {
        // "Hello!" from the server side: 0x81 0x06 then the payload.
        let mut decoder = FrameDecoder::new(1024);
        let frames = decode_all(&mut decoder, b"\x81\x06Hello!");

        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert_eq!(&frames[0].payload[..], b"Hello!");
    }

    #[test]
    fn test_decode_masked_client_frame() {
        // "Hello" masked with the RFC sample key.
        let bytes = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let mut decoder = FrameDecoder::server(1024, false);
        let frames = decode_all(&mut decoder, &bytes);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert_eq!(&frames[0].payload[..], b"Hello");
    }

    #[test]
    fn test_server_rejects_unmasked_frame() {
        let mut decoder = FrameDecoder::server(1024, false);
        let mut buf = BytesMut::from(&b"\x81\x02Hi"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::UnmaskedFrame)
        ));
    }

    #[test]
    fn test_zero_mask_leaves_payload_unchanged() {
        let bytes = [0x82, 0x83, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03];
        let mut decoder = FrameDecoder::server(1024, false);
        let frames = decode_all(&mut decoder, &bytes);
        assert_eq!(&frames[0].payload[..], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::from(&b"\x81"[..]);
        assert!(decoder.decode(&mut buf).expect("decode").is_none());

        buf.extend_from_slice(b"\x06Hel");
        assert!(decoder.decode(&mut buf).expect("decode").is_none());

        buf.extend_from_slice(b"lo!");
        let frame = decoder.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(&frame.payload[..], b"Hello!");
    }

    #[test]
    fn test_decode_pipelined_frames() {
        let mut decoder = FrameDecoder::new(1024);
        let frames = decode_all(&mut decoder, b"\x01\x03Hel\x80\x02lo");

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert!(!frames[0].fin);
        assert_eq!(&frames[0].payload[..], b"Hel");
        assert_eq!(frames[1].opcode, OpCode::Continuation);
        assert!(frames[1].fin);
        assert_eq!(&frames[1].payload[..], b"lo");
    }

    #[test]
    fn test_decode_extended_lengths() {
        let mut bytes = vec![0x82, 126, 0x01, 0x00];
        bytes.extend_from_slice(&[0xAB; 256]);
        let mut decoder = FrameDecoder::new(1 << 20);
        let frames = decode_all(&mut decoder, &bytes);
        assert_eq!(frames[0].payload.len(), 256);

        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&65536u64.to_be_bytes());
        bytes.extend_from_slice(&vec![0xCD; 65536]);
        let frames = decode_all(&mut decoder, &bytes);
        assert_eq!(frames[0].payload.len(), 65536);
    }

    #[test]
    fn test_reserved_bits_rejected() {
        for first in [0x91u8, 0xA1, 0xB1] {
            let mut decoder = FrameDecoder::new(1024);
            let mut buf = BytesMut::from(&[first, 0x00][..]);
            assert!(matches!(
                decoder.decode(&mut buf),
                Err(WebSocketError::ReservedBitsNotZero)
            ));
        }
    }

    #[test]
    fn test_invalid_opcode_rejected() {
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::from(&[0x83u8, 0x00][..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::InvalidOpCode(0x3))
        ));
    }

    #[test]
    fn test_fragmented_control_frame_rejected() {
        // Ping with FIN=0.
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::from(&[0x09u8, 0x00][..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::ControlFrameFragmented)
        ));
    }

    #[test]
    fn test_oversized_control_frame_rejected() {
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::from(&[0x88u8, 126][..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }

    #[test]
    fn test_frame_above_limit_rejected() {
        let mut decoder = FrameDecoder::new(16);
        let mut buf = BytesMut::from(&b"\x82\x11"[..]);
        buf.extend_from_slice(&[0u8; 17]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::FrameTooLarge)
        ));
    }

    #[test]
    fn test_frame_at_limit_accepted() {
        let mut decoder = FrameDecoder::new(16);
        let mut buf = BytesMut::from(&b"\x82\x10"[..]);
        buf.extend_from_slice(&[0u8; 16]);
        assert!(decoder.decode(&mut buf).expect("decode").is_some());
    }

    #[test]
    fn test_decode_eof_mid_frame() {
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::from(&b"\x81\x06Hel"[..]);
        assert!(decoder.decode(&mut buf).expect("decode").is_none());
        assert!(matches!(
            decoder.decode_eof(&mut buf),
            Err(WebSocketError::IncompleteFrame)
        ));
    }

    #[test]
    fn test_decode_eof_between_frames() {
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::new();
        assert!(decoder.decode_eof(&mut buf).expect("decode").is_none());
    }

    #[test]
    fn test_decode_close_frame() {
        let mut decoder = FrameDecoder::new(1024);
        let frames = decode_all(&mut decoder, &[0x88, 0x02, 0x03, 0xE8]);
        assert_eq!(frames[0].opcode, OpCode::Close);
        assert_eq!(
            frames[0].close_code(),
            Some(crate::close::CloseCode::Normal)
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = FrameEncoder;
        let mut decoder = FrameDecoder::new(1 << 20);

        for payload_len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload = vec![0x5Au8; payload_len];
            let mut buf = BytesMut::new();
            encoder
                .encode(Frame::binary(payload.clone()), &mut buf)
                .expect("encode");

            let frame = decoder.decode(&mut buf).expect("decode").expect("frame");
            assert!(frame.fin);
            assert_eq!(frame.opcode, OpCode::Binary);
            assert_eq!(&frame.payload[..], &payload[..]);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_encoded_server_frame_is_unmasked() {
        let mut encoder = FrameEncoder;
        let mut buf = BytesMut::new();
        encoder.encode(Frame::text("Hello!"), &mut buf).expect("encode");
        assert_eq!(&buf[..], b"\x81\x06Hello!");
        assert_eq!(buf[1] & 0x80, 0); // MASK bit clear
    }

    #[test]
    fn test_compressed_frame_inflates() {
        let mut compressor = Compressor::new();
        let compressed = compressor.compress(b"compressed payload").expect("compress");

        let mut encoder = FrameEncoder;
        let mut buf = BytesMut::new();
        encoder
            .encode(Frame::compressed(true, OpCode::Text, compressed), &mut buf)
            .expect("encode");
        assert_eq!(buf[0] & 0x40, 0x40); // RSV1 on the wire

        let mut decoder = FrameDecoder::with_compression(1024);
        let frame = decoder.decode(&mut buf).expect("decode").expect("frame");
        assert!(!frame.is_compressed);
        assert_eq!(&frame.payload[..], b"compressed payload");
    }

    #[test]
    fn test_compressed_frame_without_negotiation_rejected() {
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::from(&[0xC1u8, 0x01, 0x00][..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::CompressionNotSupported)
        ));
    }

    #[test]
    fn test_compressed_single_zero_byte_is_empty() {
        let mut decoder = FrameDecoder::with_compression(1024);
        let mut buf = BytesMut::from(&[0xC1u8, 0x01, 0x00][..]);
        let frame = decoder.decode(&mut buf).expect("decode").expect("frame");
        assert!(frame.payload.is_empty());
        assert!(!frame.is_compressed);
    }
}
