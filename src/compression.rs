//! permessage-deflate support (RFC 7692).
//!
//! Payloads travel as raw DEFLATE streams with the trailing
//! `0x00 0x00 0xFF 0xFF` flush marker stripped; the inflater re-appends it
//! before finishing a frame. Compression contexts are reset for every frame,
//! so each frame decompresses independently of its predecessors.

use std::io;

use bytes::{BufMut, BytesMut};
use flate2::{CompressError, DecompressError, Status};

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space0},
    combinator::opt,
    sequence::{pair, preceded},
    IResult,
};

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// The DEFLATE block-empty flush marker that RFC 7692 strips from the wire
/// and the inflater restores.
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Checks a `Sec-WebSocket-Extensions` header for a permessage-deflate
/// offer.
///
/// The header may list several offers separated by commas, each with its own
/// parameters. Parameters are parsed for well-formedness but otherwise
/// ignored: the server answers with a bare `permessage-deflate` and resets
/// compression contexts per frame, so context-takeover and window-bit
/// preferences have no effect here.
pub(crate) fn offers_deflate(header: &str) -> bool {
    header.split(',').any(|offer| parse_offer(offer.trim()).is_ok())
}

/// Parses one extension offer: the `permessage-deflate` token followed by
/// `; key[=value]` parameters.
fn parse_offer(input: &str) -> Result<(), nom::Err<nom::error::Error<&str>>> {
    let (mut remaining, _) = tag(PERMESSAGE_DEFLATE)(input)?;
    while !remaining.is_empty() {
        let (rest, _param) = parse_param(remaining)?;
        remaining = rest;
    }
    Ok(())
}

/// Parses a single `; key[=value]` parameter, returning the key and optional
/// value.
fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        tag(";"),
        preceded(
            space0,
            pair(
                take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                opt(preceded(tag("="), digit1)),
            ),
        ),
    )(input)
}

/// Compresses outbound payloads with raw DEFLATE.
///
/// The dictionary is reset before every frame, matching the inflater on the
/// receive side.
pub(crate) struct Compressor {
    output: BytesMut,
    compress: flate2::Compress,
}

impl Compressor {
    pub(crate) fn new() -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            compress: flate2::Compress::new(flate2::Compression::default(), false),
        }
    }

    /// Compresses `input` into a fresh buffer, with the flush marker
    /// stripped per RFC 7692.
    pub(crate) fn compress(&mut self, mut input: &[u8]) -> io::Result<BytesMut> {
        self.compress.reset();
        while !input.is_empty() {
            let consumed = self.write(input)?;
            input = &input[consumed..];
        }
        self.flush()
    }

    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        let output = &mut self.output;
        let compressor = &mut self.compress;

        let dst = chunk(output);

        let before_out = compressor.total_out();
        let before_in = compressor.total_in();

        let status = compressor.compress(input, dst, flate2::FlushCompress::None);

        let written = (compressor.total_out() - before_out) as usize;
        let consumed = (compressor.total_in() - before_in) as usize;

        unsafe { output.advance_mut(written) };

        match status {
            Ok(Status::Ok) => Ok(consumed),
            Ok(Status::StreamEnd | Status::BufError) | Err(..) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "corrupt deflate stream",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<BytesMut> {
        let output = &mut self.output;
        let compressor = &mut self.compress;

        let dst = chunk(output);
        let before_out = compressor.total_out();

        compressor
            .compress(&[], dst, flate2::FlushCompress::Sync)
            .map_err(deflate_error)?;

        let written = (compressor.total_out() - before_out) as usize;
        unsafe { output.advance_mut(written) };

        loop {
            let dst = chunk(output);

            let before_out = compressor.total_out();
            compressor
                .compress(&[], dst, flate2::FlushCompress::None)
                .map_err(deflate_error)?;

            if before_out == compressor.total_out() {
                if output.ends_with(&DEFLATE_TAIL) {
                    output.truncate(output.len() - DEFLATE_TAIL.len());
                }

                break Ok(output.split());
            }

            let written = (compressor.total_out() - before_out) as usize;
            unsafe { output.advance_mut(written) };
        }
    }
}

/// Decompresses inbound payloads, one frame at a time.
pub(crate) struct Decompressor {
    output: BytesMut,
    decompress: flate2::Decompress,
}

impl Decompressor {
    pub(crate) fn new() -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            decompress: flate2::Decompress::new(false),
        }
    }

    /// Inflates one frame's payload: resets the context, appends the flush
    /// marker the sender stripped and drains the inflater.
    pub(crate) fn decompress(&mut self, input: &[u8]) -> io::Result<BytesMut> {
        self.decompress.reset(false);
        self.write(input)?;
        self.write(&DEFLATE_TAIL)?;
        self.flush()
    }

    fn write(&mut self, mut input: &[u8]) -> io::Result<()> {
        let output = &mut self.output;
        let decompressor = &mut self.decompress;

        while !input.is_empty() {
            let dst = chunk(output);

            let before_out = decompressor.total_out();
            let before_in = decompressor.total_in();

            let status = decompressor.decompress(input, dst, flate2::FlushDecompress::None);

            let read = (decompressor.total_out() - before_out) as usize;
            let consumed = (decompressor.total_in() - before_in) as usize;

            unsafe { output.advance_mut(read) };

            input = &input[consumed..];

            match status {
                Ok(Status::Ok | Status::BufError | Status::StreamEnd) => {}
                Err(..) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "corrupt deflate stream",
                    ))
                }
            }
        }

        Ok(())
    }

    fn flush(&mut self) -> io::Result<BytesMut> {
        let output = &mut self.output;
        let decompressor = &mut self.decompress;

        let dst = chunk(output);
        let before_out = decompressor.total_out();

        decompressor
            .decompress(&[], dst, flate2::FlushDecompress::Sync)
            .map_err(inflate_error)?;

        let written = (decompressor.total_out() - before_out) as usize;
        unsafe { output.advance_mut(written) };

        loop {
            let dst = chunk(output);

            let before_out = decompressor.total_out();
            decompressor
                .decompress(&[], dst, flate2::FlushDecompress::None)
                .map_err(inflate_error)?;

            if before_out == decompressor.total_out() {
                break Ok(output.split());
            }

            let written = (decompressor.total_out() - before_out) as usize;
            unsafe {
                output.advance_mut(written);
            }
        }
    }
}

fn deflate_error(err: CompressError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Compression error: {}", err),
    )
}

fn inflate_error(err: DecompressError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Decompression error: {}", err),
    )
}

/// Returns the spare capacity of `output` as an initialized byte slice,
/// growing the buffer when it is full.
///
/// # Safety
/// Treating uninitialized spare capacity as `&mut [u8]` is sound here
/// because the bytes are only written through the slice and `advance_mut`
/// is called with the written count afterwards.
fn chunk(output: &mut BytesMut) -> &mut [u8] {
    if output.len() == output.capacity() {
        // chunk_mut on its own reserves only 64 bytes
        output.reserve(1024);
    }

    let uninitbuf = output.spare_capacity_mut();
    unsafe { &mut *(uninitbuf as *mut [std::mem::MaybeUninit<u8>] as *mut [u8]) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offers_deflate() {
        assert!(offers_deflate("permessage-deflate"));
        assert!(offers_deflate(
            "permessage-deflate; client_max_window_bits"
        ));
        assert!(offers_deflate(
            "permessage-deflate; client_max_window_bits=15; server_no_context_takeover"
        ));
        // first offer wins even when others are unknown
        assert!(offers_deflate(
            "permessage-bzip2, permessage-deflate; client_no_context_takeover"
        ));
    }

    #[test]
    fn test_rejects_other_extensions() {
        assert!(!offers_deflate("permessage-bzip2"));
        assert!(!offers_deflate(""));
        assert!(!offers_deflate("deflate-frame"));
        // malformed parameter list
        assert!(!offers_deflate("permessage-deflate; =15"));
    }

    #[test]
    fn test_roundtrip() {
        let mut compressor = Compressor::new();
        let mut decompressor = Decompressor::new();

        let data = b"a payload worth compressing, a payload worth compressing";
        let compressed = compressor.compress(data).expect("compress");
        assert!(!compressed.is_empty());
        assert!(!compressed.ends_with(&DEFLATE_TAIL));

        let decompressed = decompressor.decompress(&compressed).expect("decompress");
        assert_eq!(&decompressed[..], &data[..]);
    }

    #[test]
    fn test_frames_decompress_independently() {
        let mut compressor = Compressor::new();
        let compressed = compressor.compress(b"first frame").expect("compress");

        // A decompressor that has never seen the first frame must still
        // inflate the second, since contexts are reset per frame.
        let compressed_second = compressor.compress(b"second frame").expect("compress");
        let mut fresh = Decompressor::new();
        let decompressed = fresh.decompress(&compressed_second).expect("decompress");
        assert_eq!(&decompressed[..], b"second frame");

        let mut other = Decompressor::new();
        let decompressed = other.decompress(&compressed).expect("decompress");
        assert_eq!(&decompressed[..], b"first frame");
    }

    #[test]
    fn test_corrupt_stream_errors() {
        let mut decompressor = Decompressor::new();
        assert!(decompressor.decompress(&[0xFF, 0xFF, 0xFF, 0x00]).is_err());
    }
}
