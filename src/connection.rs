//! Per-connection engine and the [`Client`] handle.
//!
//! After the handshake the stream is split: the engine owns the read half
//! and drives frames through the decoder and the message assembler,
//! invoking callbacks serially on the connection's task. The write half
//! lives behind the [`Client`] handle that callbacks receive; sends from
//! one task appear on the wire in call order.
//!
//! The engine ends when the peer sends a close frame, the transport drops,
//! a protocol violation occurs, or the application calls
//! [`Client::close_immediately`]. Whatever the path, the disconnect
//! callback fires exactly once and the socket is released with the engine.

use std::{
    io::ErrorKind,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    close::CloseCode,
    codec::{FrameDecoder, FrameEncoder},
    compression::Compressor,
    error_info,
    frame::{Frame, OpCode},
    handshake,
    message::MessageAssembler,
    server::{Callbacks, Config, DataHandler},
    ErrorInfo, Result, WebSocketError,
};

/// Payload bytes per fragment for the auto-chunking send methods: the
/// largest payload whose frame still fits a 16-bit extended length together
/// with its 4-byte header.
pub(crate) const CHUNK_SIZE: usize = 65531;

/// Control frames carry at most 125 payload bytes; a close frame spends two
/// of them on the status code.
const MAX_CONTROL_PAYLOAD: usize = 125;

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ClientInner {
    addr: SocketAddr,
    writer: Mutex<FramedWrite<BoxWriter, FrameEncoder>>,
    /// Present when permessage-deflate was negotiated for this connection.
    deflate: Option<Mutex<Compressor>>,
    close_requested: AtomicBool,
}

/// Handle to one connected peer.
///
/// Handed to every callback; cheap to clone. All sends go through an
/// internal lock, so concurrent senders interleave at frame granularity
/// and never corrupt the stream. Send methods resolve to `Ok(true)` once
/// the frame is written, `Ok(false)` when the peer is already gone, and an
/// error for any other I/O failure.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub(crate) fn new(addr: SocketAddr, writer: BoxWriter, compression: bool) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                addr,
                writer: Mutex::new(FramedWrite::new(writer, FrameEncoder)),
                deflate: compression.then(|| Mutex::new(Compressor::new())),
                close_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Peer address of this connection.
    pub fn address(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Sends a text message, fragmenting payloads above 65531 bytes.
    ///
    /// Large payloads go out as a text frame with FIN=0 followed by
    /// continuation frames, the last of which carries FIN=1.
    pub async fn text(&self, data: impl AsRef<[u8]>) -> Result<bool> {
        self.send_fragmented(OpCode::Text, data.as_ref()).await
    }

    /// Sends a binary message, fragmenting payloads above 65531 bytes.
    pub async fn binary(&self, data: impl AsRef<[u8]>) -> Result<bool> {
        self.send_fragmented(OpCode::Binary, data.as_ref()).await
    }

    /// Sends a text message as a single frame regardless of size.
    pub async fn text_all(&self, data: impl AsRef<[u8]>) -> Result<bool> {
        self.send_data(OpCode::Text, true, data.as_ref()).await
    }

    /// Sends a binary message as a single frame regardless of size.
    pub async fn binary_all(&self, data: impl AsRef<[u8]>) -> Result<bool> {
        self.send_data(OpCode::Binary, true, data.as_ref()).await
    }

    /// Starts the closing handshake with status 1000 and no reason.
    ///
    /// The connection stays open until the peer echoes a close frame; the
    /// engine then fires the close and disconnect callbacks and releases
    /// the socket.
    pub async fn close(&self) -> Result<bool> {
        self.close_with(CloseCode::Normal, "").await
    }

    /// Starts the closing handshake with the given status code and reason.
    pub async fn close_with(&self, code: CloseCode, reason: &str) -> Result<bool> {
        if 2 + reason.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.send_frame(Frame::close(code, reason)).await
    }

    /// Sends an empty ping frame.
    pub async fn ping(&self) -> Result<bool> {
        self.ping_with([]).await
    }

    /// Sends a ping frame with a payload of at most 125 bytes.
    pub async fn ping_with(&self, payload: impl AsRef<[u8]>) -> Result<bool> {
        let payload = payload.as_ref();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.send_frame(Frame::ping(payload)).await
    }

    /// Sends an empty pong frame.
    pub async fn pong(&self) -> Result<bool> {
        self.pong_with([]).await
    }

    /// Sends a pong frame with a payload of at most 125 bytes, typically
    /// echoing a ping's payload.
    pub async fn pong_with(&self, payload: impl AsRef<[u8]>) -> Result<bool> {
        let payload = payload.as_ref();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.send_frame(Frame::pong(payload)).await
    }

    /// Asks the engine to drop the connection without a closing handshake.
    ///
    /// No close frame is sent; the read loop notices the request when it
    /// next wakes and releases the socket.
    pub fn close_immediately(&self) {
        self.inner.close_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_close_requested(&self) -> bool {
        self.inner.close_requested.load(Ordering::SeqCst)
    }

    async fn send_fragmented(&self, opcode: OpCode, data: &[u8]) -> Result<bool> {
        if data.len() <= CHUNK_SIZE {
            return self.send_data(opcode, true, data).await;
        }

        let mut opcode = opcode;
        let mut chunks = data.chunks(CHUNK_SIZE).peekable();
        while let Some(chunk) = chunks.next() {
            let fin = chunks.peek().is_none();
            if !self.send_data(opcode, fin, chunk).await? {
                return Ok(false);
            }
            opcode = OpCode::Continuation;
        }
        Ok(true)
    }

    /// Builds one data frame, compressing the payload when the connection
    /// negotiated permessage-deflate. Empty payloads stay uncompressed so
    /// RSV1 is never set on an empty frame.
    async fn send_data(&self, opcode: OpCode, fin: bool, data: &[u8]) -> Result<bool> {
        let frame = match &self.inner.deflate {
            Some(deflate) if !data.is_empty() => {
                let compressed = deflate.lock().await.compress(data)?;
                Frame::compressed(fin, opcode, compressed)
            }
            _ => Frame::new(fin, opcode, None, data),
        };
        self.send_frame(frame).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<bool> {
        let mut writer = self.inner.writer.lock().await;
        match writer.send(frame).await {
            Ok(()) => Ok(true),
            Err(WebSocketError::Io(err))
                if matches!(
                    err.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::NotConnected
                ) =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.inner.addr)
            .finish_non_exhaustive()
    }
}

/// Runs the full lifecycle of one accepted connection: handshake, read
/// loop, teardown.
pub(crate) async fn handle<S>(
    mut stream: S,
    addr: SocketAddr,
    config: &Config,
    callbacks: &Callbacks,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let handshake = match handshake::accept(
        &mut stream,
        config.compression,
        callbacks.handshake.as_deref(),
    )
    .await
    {
        Ok(handshake) => handshake,
        Err(err) => {
            log::debug!("handshake with {addr} failed: {err}");
            return;
        }
    };

    let (rd, wr) = tokio::io::split(stream);
    let mut frames = FramedRead::with_capacity(
        rd,
        FrameDecoder::server(config.max_msg_size, config.compression),
        config.read_buffer_size,
    );
    if !handshake.leftover.is_empty() {
        frames.read_buffer_mut().extend_from_slice(&handshake.leftover);
    }

    let client = Client::new(addr, Box::new(wr), config.compression);
    let mut assembler = MessageAssembler::new(config.max_msg_size);

    log::debug!("connection with {addr} open");

    while !client.is_close_requested() {
        let frame = match frames.next().await {
            None => break,
            Some(Ok(frame)) => frame,
            Some(Err(err)) if err.is_benign_disconnect() => break,
            Some(Err(err)) => {
                report_error(callbacks, Some(&client), error_info!("read_loop", err)).await;
                break;
            }
        };

        match frame.opcode {
            OpCode::Close => {
                log::trace!("{addr}: close frame, code {:?}", frame.close_code());
                dispatch_data(&callbacks.close, &client, frame.payload.freeze()).await;
                break;
            }
            OpCode::Ping => dispatch_data(&callbacks.ping, &client, frame.payload.freeze()).await,
            OpCode::Pong => dispatch_data(&callbacks.pong, &client, frame.payload.freeze()).await,
            _ => match assembler.feed(frame) {
                Ok(Some(message)) => {
                    let handler = match message.opcode {
                        OpCode::Binary => &callbacks.binary,
                        _ => &callbacks.text,
                    };
                    dispatch_data(handler, &client, message.payload.freeze()).await;
                }
                Ok(None) => {}
                Err(err) => {
                    report_error(callbacks, Some(&client), error_info!("read_loop", err)).await;
                    break;
                }
            },
        }
    }

    if let Some(handler) = &callbacks.disconnect {
        guarded(handler(client.clone())).await;
    }

    log::debug!("connection with {addr} closed");
}

async fn dispatch_data(handler: &Option<DataHandler>, client: &Client, payload: Bytes) {
    if let Some(handler) = handler {
        guarded(handler(client.clone(), payload)).await;
    }
}

/// Routes an error to the error callback, or to the log when none is
/// registered.
pub(crate) async fn report_error(callbacks: &Callbacks, client: Option<&Client>, info: ErrorInfo) {
    if let Some(handler) = &callbacks.error {
        guarded(handler(client.cloned(), info)).await;
    } else {
        log::debug!("websocket error: {info}");
    }
}

/// Awaits a callback future, catching panics so a misbehaving handler
/// cannot take the connection engine down with it.
async fn guarded(fut: BoxFuture<'static, ()>) {
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        let message = panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        log::error!("callback panicked: {message}");
    }
}
