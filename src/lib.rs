//! # wavesock
//!
//! A callback-driven WebSocket server ([RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455))
//! with optional permessage-deflate compression
//! ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)).
//!
//! The crate is server-only: it accepts TCP connections, performs the HTTP
//! upgrade handshake, and runs one connection engine per peer on its own
//! tokio task. Applications register handlers for the events they care
//! about and talk back through the [`Client`] handle:
//!
//! ```no_run
//! use wavesock::{Config, Server};
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> wavesock::Result<()> {
//!     let mut server = Server::new([127, 0, 0, 1].into(), 8080);
//!     server.set_config(Config {
//!         max_msg_size: 1 << 20,
//!         ..Config::default()
//!     });
//!
//!     server.on_text(|client, data| async move {
//!         // echo the message back
//!         let _ = client.text(&data).await;
//!     });
//!     server.on_close(|client, _payload| async move {
//!         let _ = client.close().await;
//!     });
//!
//!     server.listen().await
//! }
//! ```
//!
//! ## Architecture
//!
//! Bytes flow through three layers on the way in:
//!
//! - [`codec`]: decodes individual frames (header parsing, unmasking,
//!   inbound decompression) from a read buffer that accumulates partial
//!   frames across socket reads;
//! - the message assembler: stitches fragmented messages together and
//!   enforces the message size limit;
//! - the connection engine: routes control frames, drives the registered
//!   callbacks and owns the connection lifecycle.
//!
//! Outbound, [`Client`] compresses and fragments payloads as needed and
//! feeds frames to the encoder.
//!
//! ## Scope
//!
//! No TLS, no client role, no subprotocol negotiation, no automatic
//! ping/pong probing, no extensions beyond permessage-deflate. The header
//! map of the upgrade request is handed to the application, which decides
//! about origins, authentication and subprotocols on its own.

use thiserror::Error;

pub mod close;
pub mod codec;
mod compression;
mod connection;
pub mod frame;
mod handshake;
mod mask;
mod message;
mod server;

pub use close::CloseCode;
pub use connection::Client;
pub use frame::{Frame, OpCode};
pub use handshake::{accept_key, HeaderMap};
pub use message::Message;
pub use server::{Config, Server, DEFAULT_PORT};

/// Result type for WebSocket operations.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors surfaced by the handshake, the frame codec, the message
/// assembler and the server shell.
///
/// I/O errors with kind `ConnectionReset`, `TimedOut` or `NotConnected`
/// are treated as benign peer loss by the connection engine: the engine
/// ends silently and only the disconnect callback fires. Every other
/// variant reaching the engine is reported through the error callback
/// first.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The bytes on the socket never formed a complete HTTP upgrade
    /// request.
    #[error("malformed http upgrade request")]
    MalformedHandshake,

    /// A request or header line exceeded the 8 KiB line bound.
    #[error("header line too long")]
    HeaderLineTooLong,

    /// The upgrade request carried no `Sec-WebSocket-Key` header.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The server requires permessage-deflate but the client did not offer
    /// it.
    #[error("client did not offer permessage-deflate")]
    CompressionNotNegotiated,

    /// The application's handshake callback vetoed the connection.
    #[error("handshake rejected by application")]
    HandshakeRejected,

    /// A frame header carried an opcode outside the set defined by RFC
    /// 6455.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// RSV2 or RSV3 was set; no negotiated extension gives them meaning.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A close, ping or pong frame arrived with the FIN bit clear.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carried more than 125 payload bytes.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// A client frame arrived without a masking key; RFC 6455 requires
    /// clients to mask every frame.
    #[error("unmasked frame received from client")]
    UnmaskedFrame,

    /// A single frame's payload exceeds the configured maximum.
    #[error("frame too large")]
    FrameTooLarge,

    /// The frame announced a 64-bit payload length that does not fit this
    /// target's address space.
    #[error("64-bit payload length not supported on this target")]
    PayloadLengthUnsupported,

    /// The peer went away in the middle of a frame.
    #[error("connection closed before a full frame arrived")]
    IncompleteFrame,

    /// The accumulated fragments of a message exceed the configured
    /// maximum message size.
    #[error("message too large")]
    MessageTooLarge,

    /// A continuation frame with no message in progress, or a fresh data
    /// frame while a fragmented message is still open.
    #[error("invalid continuation frame")]
    InvalidContinuationFrame,

    /// A compressed frame arrived on a connection that never negotiated
    /// permessage-deflate.
    #[error("received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// `read_buffer_size` must not exceed `max_msg_size`.
    #[error("read buffer of {read_buffer_size} bytes exceeds max message size of {max_msg_size}")]
    ConfigReadBufferExceedsMaxMessage {
        read_buffer_size: usize,
        max_msg_size: usize,
    },

    /// A read buffer beyond 65535 bytes needs a 64-bit target.
    #[error("read buffer of {read_buffer_size} bytes requires a 64-bit target")]
    ConfigReadBufferNeeds64Bit { read_buffer_size: usize },

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WebSocketError {
    /// Peer-loss I/O errors that end a connection without being worth
    /// reporting.
    pub(crate) fn is_benign_disconnect(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self,
            WebSocketError::Io(err) if matches!(
                err.kind(),
                ErrorKind::ConnectionReset | ErrorKind::TimedOut | ErrorKind::NotConnected
            )
        )
    }
}

/// An error plus the place in this crate that raised it, as handed to the
/// error callback.
#[derive(Debug)]
pub struct ErrorInfo {
    /// What went wrong.
    pub error: WebSocketError,
    /// Source file that reported the error.
    pub file: &'static str,
    /// Engine function that reported the error.
    pub function: &'static str,
    /// Line in `file`.
    pub line: u32,
    /// Column in `file`.
    pub column: u32,
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} at {}:{}:{})",
            self.error, self.function, self.file, self.line, self.column
        )
    }
}

/// Builds an [`ErrorInfo`] carrying the current source position.
macro_rules! error_info {
    ($function:expr, $err:expr) => {
        $crate::ErrorInfo {
            error: $err,
            file: file!(),
            function: $function,
            line: line!(),
            column: column!(),
        }
    };
}
pub(crate) use error_info;
