//! WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! A frame is the atomic wire unit. Data frames (`Text`, `Binary`,
//! `Continuation`) carry application payload and may be fragmented; control
//! frames (`Close`, `Ping`, `Pong`) manage the connection, are never
//! fragmented and carry at most 125 payload bytes.
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
//! ```
//!
//! Frames produced by the decoder are always unmasked; masking is applied by
//! the encoder when the endpoint runs in the client role. RSV1 marks the
//! opening frame of a compressed message when `permessage-deflate` was
//! negotiated.

use bytes::Bytes;

use crate::{close::CloseCode, Error};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Longest close reason that fits a control frame next to the 2-byte code.
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// WebSocket operation code, the 4-bit frame type identifier.
///
/// Values are defined in
/// [RFC 6455 Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// `Continuation = 0x0`, `Text = 0x1`, `Binary = 0x2`, `Close = 0x8`,
/// `Ping = 0x9`, `Pong = 0xA`. The ranges 0x3-0x7 and 0xB-0xF are reserved
/// and rejected during parsing.
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
    /// Control frames must not be fragmented and carry at most
    /// [`MAX_CONTROL_PAYLOAD`] bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(Error::InvalidOpCode(value)),
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

/// A single WebSocket frame: FIN flag, compression marker (RSV1), opcode and
/// an unmasked payload.
///
/// Most code works with whole messages through [`Connection`]; frames only
/// surface at the codec and extension layers. The constructors below build
/// protocol-correct frames for each type.
///
/// ```rust
/// use wavesock::frame::Frame;
/// use wavesock::CloseCode;
///
/// let text = Frame::text("Hello, WebSocket!");
/// let ping = Frame::ping(Vec::new());
/// let close = Frame::close(CloseCode::Normal, "Normal closure.");
/// ```
///
/// [`Connection`]: crate::Connection
#[derive(Debug, Clone)]
pub struct Frame {
    /// Final fragment flag. `true` completes a message.
    pub fin: bool,
    /// RSV1: set on the opening frame of a compressed message.
    pub(crate) compressed: bool,
    /// The frame type.
    pub opcode: OpCode,
    /// Payload bytes, already unmasked.
    pub payload: Bytes,
}

impl Frame {
    /// Creates an unfragmented text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            compressed: false,
            opcode: OpCode::Text,
            payload: payload.into(),
        }
    }

    /// Creates an unfragmented binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            compressed: false,
            opcode: OpCode::Binary,
            payload: payload.into(),
        }
    }

    /// Creates a ping frame. The payload is truncated to
    /// [`MAX_CONTROL_PAYLOAD`] bytes.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        let mut payload: Bytes = payload.into();
        payload.truncate(MAX_CONTROL_PAYLOAD);
        Self {
            fin: true,
            compressed: false,
            opcode: OpCode::Ping,
            payload,
        }
    }

    /// Creates a pong frame, normally echoing a ping's payload.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        let mut payload: Bytes = payload.into();
        payload.truncate(MAX_CONTROL_PAYLOAD);
        Self {
            fin: true,
            compressed: false,
            opcode: OpCode::Pong,
            payload,
        }
    }

    /// Creates a close frame carrying a status code and reason.
    ///
    /// The payload is the 2-byte big-endian code followed by the UTF-8
    /// reason, truncated at a character boundary to [`MAX_CLOSE_REASON`]
    /// bytes so the frame stays within the control-frame limit.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let reason = truncate_utf8(reason, MAX_CLOSE_REASON);
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());

        Self {
            fin: true,
            compressed: false,
            opcode: OpCode::Close,
            payload: payload.into(),
        }
    }

    /// Creates a close frame with a raw payload, without enforcing the
    /// code/reason structure. An empty payload is a codeless close.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            compressed: false,
            opcode: OpCode::Close,
            payload: payload.into(),
        }
    }

    /// Creates a continuation frame of a fragmented message.
    pub fn continuation(payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            compressed: false,
            opcode: OpCode::Continuation,
            payload: payload.into(),
        }
    }

    /// Creates the opening frame of a (possibly fragmented, possibly
    /// compressed) data message.
    pub(crate) fn message(opcode: OpCode, payload: Bytes, fin: bool, compressed: bool) -> Self {
        Self {
            fin,
            compressed,
            opcode,
            payload,
        }
    }

    /// Whether this frame carries a compressed message payload (RSV1).
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Extracts the status code from a close frame payload.
    ///
    /// Returns `None` when the payload is empty (a codeless close) or too
    /// short to hold a code.
    pub fn close_code(&self) -> Option<CloseCode> {
        let bytes = self.payload.get(0..2)?;
        Some(CloseCode::from(u16::from_be_bytes([bytes[0], bytes[1]])))
    }

    /// Extracts the UTF-8 reason from a close frame payload, if present and
    /// valid.
    pub fn close_reason(&self) -> Option<&str> {
        if self.payload.len() <= 2 {
            return None;
        }
        std::str::from_utf8(&self.payload[2..]).ok()
    }
}

/// Cuts `s` to at most `max` bytes without splitting a character.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_is_control() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Continuation.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
    }

    #[test]
    fn opcode_conversions() {
        for byte in [0x0u8, 0x1, 0x2, 0x8, 0x9, 0xA] {
            assert_eq!(u8::from(OpCode::try_from(byte).unwrap()), byte);
        }
        for byte in [0x3u8, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(matches!(
                OpCode::try_from(byte),
                Err(Error::InvalidOpCode(b)) if b == byte
            ));
        }
    }

    #[test]
    fn close_frame_layout() {
        let frame = Frame::close(CloseCode::Normal, "Normal closure.");
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
        assert_eq!(frame.close_code(), Some(CloseCode::Normal));
        assert_eq!(frame.close_reason(), Some("Normal closure."));
    }

    #[test]
    fn close_reason_is_truncated() {
        let reason = "x".repeat(200);
        let frame = Frame::close(CloseCode::Away, &reason);
        assert_eq!(frame.payload.len(), 2 + MAX_CLOSE_REASON);

        // Truncation never splits a multi-byte character.
        let reason = "é".repeat(100); // 2 bytes each
        let frame = Frame::close(CloseCode::Away, &reason);
        assert!(frame.payload.len() <= 2 + MAX_CLOSE_REASON);
        assert!(frame.close_reason().is_some());
    }

    #[test]
    fn codeless_close() {
        let frame = Frame::close_raw(Bytes::new());
        assert_eq!(frame.close_code(), None);
        assert_eq!(frame.close_reason(), None);
    }

    #[test]
    fn control_payloads_are_capped() {
        let frame = Frame::ping(vec![0u8; 300]);
        assert_eq!(frame.payload.len(), MAX_CONTROL_PAYLOAD);
        let frame = Frame::pong(vec![0u8; 300]);
        assert_eq!(frame.payload.len(), MAX_CONTROL_PAYLOAD);
    }

    #[test]
    fn constructors_set_fin() {
        assert!(Frame::text("x").fin);
        assert!(Frame::binary(vec![1, 2]).fin);
        assert!(!Frame::continuation(Bytes::new(), false).fin);
        assert!(Frame::continuation(Bytes::new(), true).fin);
    }
}
