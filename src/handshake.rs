//! Server side of the HTTP/1.1 upgrade handshake
//! ([RFC 6455 Section 4](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2)).
//!
//! The handshake reads the client's upgrade request straight off the
//! socket, validates it, and answers with `101 Switching Protocols` or
//! `400 Bad Request`. Bytes that arrive after the request terminator
//! (pipelined frames) are handed back so the frame decoder starts with
//! them.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{compression, Result, WebSocketError};

/// Fixed GUID appended to the client key when computing the accept token,
/// from RFC 6455 Section 1.3.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on a single request or header line. Browsers routinely send
/// multi-kilobyte cookie and user-agent headers, so this is deliberately
/// generous.
pub(crate) const MAX_HEADER_LINE: usize = 8 * 1024;

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// Request headers as received, keyed by their exact wire casing.
pub type HeaderMap = HashMap<String, String>;

/// Result of a successful handshake.
#[derive(Debug)]
pub(crate) struct Handshake {
    /// All request headers, available to the application callback and for
    /// later inspection.
    pub(crate) headers: HeaderMap,
    /// Bytes read past the end of the HTTP request.
    pub(crate) leftover: BytesMut,
}

/// Computes the `Sec-WebSocket-Accept` token for a client key:
/// `base64(SHA-1(key ‖ GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Performs the server handshake on a freshly accepted stream.
///
/// When `compression` is set the client must offer `permessage-deflate` in
/// `Sec-WebSocket-Extensions`, and the response echoes the bare extension
/// token. The application `callback`, when present, sees the full header
/// map and may veto the connection.
///
/// Every failure path answers `400 Bad Request` (best effort) before
/// returning the error; I/O errors while reading the request surface
/// as-is.
pub(crate) async fn accept<S>(
    stream: &mut S,
    compression: bool,
    callback: Option<&(dyn Fn(&HeaderMap) -> bool + Send + Sync)>,
) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = match read_request(stream).await {
        Ok(parts) => parts,
        Err(err @ WebSocketError::Io(_)) => return Err(err),
        Err(err) => return reject(stream, err).await,
    };
    let headers = match parse_headers(&head) {
        Ok(headers) => headers,
        Err(err) => return reject(stream, err).await,
    };

    let Some(key) = headers.get("Sec-WebSocket-Key") else {
        return reject(stream, WebSocketError::MissingSecWebSocketKey).await;
    };

    if compression {
        let offered = headers
            .get("Sec-WebSocket-Extensions")
            .is_some_and(|value| compression::offers_deflate(value));
        if !offered {
            return reject(stream, WebSocketError::CompressionNotNegotiated).await;
        }
    }

    if let Some(callback) = callback {
        if !callback(&headers) {
            return reject(stream, WebSocketError::HandshakeRejected).await;
        }
    }

    let accept = accept_key(key);
    let mut response = String::with_capacity(192);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    if compression {
        response.push_str("Sec-WebSocket-Extensions: permessage-deflate\r\n");
    }
    response.push_str("Sec-WebSocket-Accept: ");
    response.push_str(&accept);
    response.push_str("\r\n\r\n");

    stream.write_all(response.as_bytes()).await?;

    log::debug!("handshake accepted (compression={compression})");

    Ok(Handshake { headers, leftover })
}

/// Answers `400 Bad Request` and returns `err`. The write is best effort:
/// a peer that already went away does not mask the original error.
async fn reject<S, T>(stream: &mut S, err: WebSocketError) -> Result<T>
where
    S: AsyncWrite + Unpin,
{
    log::debug!("handshake rejected: {err}");
    let _ = stream.write_all(BAD_REQUEST).await;
    Err(err)
}

/// Reads from the stream until the `\r\n\r\n` request terminator, returning
/// the request head (terminator stripped) and any bytes past it.
async fn read_request<S>(stream: &mut S) -> Result<(BytesMut, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let mut head = buf.split_to(pos + 4);
            head.truncate(pos);
            return Ok((head, buf));
        }

        // Bound the line currently being received, so a peer cannot grow
        // the buffer without ever sending a line break.
        let line_start = buf
            .windows(2)
            .rposition(|w| w == b"\r\n")
            .map_or(0, |pos| pos + 2);
        if buf.len() - line_start > MAX_HEADER_LINE {
            return Err(WebSocketError::HeaderLineTooLong);
        }

        if stream.read_buf(&mut buf).await? == 0 {
            return Err(WebSocketError::MalformedHandshake);
        }
    }
}

/// Splits the request head into headers. The request line is skipped; each
/// remaining line is divided at the first `": "`, keeping the name's wire
/// casing. Lines without a separator are ignored.
fn parse_headers(head: &[u8]) -> Result<HeaderMap> {
    let text = std::str::from_utf8(head).map_err(|_| WebSocketError::MalformedHandshake)?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(WebSocketError::MalformedHandshake)?;
    if request_line.len() > MAX_HEADER_LINE {
        return Err(WebSocketError::HeaderLineTooLong);
    }

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.len() > MAX_HEADER_LINE {
            return Err(WebSocketError::HeaderLineTooLong);
        }
        if let Some((name, value)) = line.split_once(": ") {
            headers.insert(name.to_owned(), value.to_owned());
        }
    }
    Ok(headers)
}
