//! Assembly of data frames into complete messages.
//!
//! A message is one text or binary frame, or a text/binary frame with
//! FIN=0 followed by continuation frames, the last of which carries FIN=1.
//! Control frames never reach the assembler; the connection engine routes
//! them out-of-band and the codec has already validated their framing.

use bytes::BytesMut;

use crate::{
    frame::{Frame, OpCode},
    Result, WebSocketError,
};

/// A complete, reassembled message.
pub struct Message {
    /// [`OpCode::Text`] or [`OpCode::Binary`], taken from the first frame.
    pub opcode: OpCode,
    /// The concatenated payload of every fragment.
    pub payload: BytesMut,
}

/// Collects data-frame payloads until a final frame completes the message.
///
/// The assembler enforces the fragmentation rules of RFC 6455 Section 5.4
/// and the configured maximum message size; the connection is torn down on
/// any violation, so the assembler never has to recover from one.
pub(crate) struct MessageAssembler {
    /// Opcode of the message in progress; `None` between messages.
    opcode: Option<OpCode>,
    accumulated: BytesMut,
    /// Largest permitted total payload across all fragments.
    max_msg_size: usize,
}

impl MessageAssembler {
    pub(crate) fn new(max_msg_size: usize) -> Self {
        Self {
            opcode: None,
            accumulated: BytesMut::with_capacity(1024),
            max_msg_size,
        }
    }

    /// Feeds one data frame, returning the finished message once the final
    /// fragment has arrived.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidContinuationFrame`] for a continuation
    ///   with no message in progress, or a fresh text/binary frame while
    ///   one is in progress;
    /// - [`WebSocketError::MessageTooLarge`] once the accumulated payload
    ///   would exceed the configured maximum;
    /// - [`WebSocketError::InvalidOpCode`] if a control frame is fed in
    ///   (engine misuse, kept as a guard).
    pub(crate) fn feed(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.opcode.is_some() {
                    return Err(WebSocketError::InvalidContinuationFrame);
                }
                self.opcode = Some(frame.opcode);
            }
            OpCode::Continuation => {
                if self.opcode.is_none() {
                    return Err(WebSocketError::InvalidContinuationFrame);
                }
            }
            _ => return Err(WebSocketError::InvalidOpCode(u8::from(frame.opcode))),
        }

        if self.accumulated.len() + frame.payload.len() > self.max_msg_size {
            return Err(WebSocketError::MessageTooLarge);
        }
        self.accumulated.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        // opcode checked above
        let opcode = self.opcode.take().unwrap_or(frame.opcode);
        let payload = std::mem::replace(&mut self.accumulated, BytesMut::with_capacity(1024));
        Ok(Some(Message { opcode, payload }))
    }
}
