//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
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
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! A [`Frame`] always holds its payload unmasked. The masking key, when present, is applied by the
//! [`Encoder`](crate::codec::Encoder) on the way out and removed by the
//! [`Decoder`](crate::codec::Decoder) on the way in, which keeps the key around so that a decoded frame
//! compares equal to the frame that was encoded.
//!
//! ```rust
//! use wsengine::{close::CloseCode, frame::Frame};
//!
//! let text = Frame::text("Hello, WebSocket!");
//! let ping = Frame::ping("are you there?");
//! let close = Frame::close(CloseCode::Normal, "done");
//! assert!(close.opcode.is_control());
//! ```
use crate::{close::CloseCode, payload::Payload, WebSocketError};

/// WebSocket operation code (OpCode) that determines the meaning of a frame.
///
/// The numeric values are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when decoding.
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
    /// Control frames cannot be fragmented and carry at most 125 bytes of payload.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Text` and `Binary`, the opcodes that start a message.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
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

/// A single WebSocket frame.
///
/// **Note: most users never need frames.** The [`WebSocket`](crate::WebSocket) handle sends and
/// receives whole messages and answers control frames by itself. Frames are exposed for code that
/// speaks the wire protocol directly through the [`codec`](crate::codec).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// RSV1, set on the first frame of a compressed message.
    pub(crate) is_compressed: bool,
    pub(crate) rsv2: bool,
    pub(crate) rsv3: bool,
    /// The masking key used on the wire, if any.
    pub(crate) mask: Option<[u8; 4]>,
    /// The unmasked payload.
    pub payload: Payload,
}

pub(crate) const MAX_HEAD_SIZE: usize = 14;

impl Frame {
    /// Creates a new frame.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<Payload>) -> Self {
        Self {
            fin,
            opcode,
            is_compressed: false,
            rsv2: false,
            rsv3: false,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a new frame whose payload was compressed with permessage-deflate (RSV1 set).
    pub fn compress(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            is_compressed: true,
            ..Self::new(fin, opcode, mask, payload)
        }
    }

    /// A final text frame.
    pub fn text(payload: impl Into<Payload>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// A final binary frame.
    pub fn binary(payload: impl Into<Payload>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// A continuation frame.
    pub fn continuation(fin: bool, payload: impl Into<Payload>) -> Self {
        Self::new(fin, OpCode::Continuation, None, payload)
    }

    pub fn ping(payload: impl Into<Payload>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    pub fn pong(payload: impl Into<Payload>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// A close frame with a status code and reason, see [`Payload::close`].
    pub fn close(code: CloseCode, reason: &str) -> Self {
        Self::new(true, OpCode::Close, None, Payload::close(code, reason))
    }

    /// A close frame with a raw payload.
    ///
    /// This method does not validate if `payload` is a valid close frame payload.
    pub fn close_raw(payload: impl Into<Payload>) -> Self {
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Sets the FIN flag.
    pub fn with_fin(self, fin: bool) -> Self {
        Self { fin, ..self }
    }

    /// Sets the masking key used when the frame is encoded.
    pub fn with_mask(self, mask: [u8; 4]) -> Self {
        Self {
            mask: Some(mask),
            ..self
        }
    }

    /// Sets the RSV2 and RSV3 bits. No extension defines them, so peers reject such frames.
    pub fn with_reserved_bits(self, rsv2: bool, rsv3: bool) -> Self {
        Self { rsv2, rsv3, ..self }
    }

    /// Whether RSV1 (compressed) is set.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    /// The masking key of the frame, if any.
    #[inline]
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline]
    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    /// Writes the frame header into `head` and returns its length.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7
            | (self.is_compressed as u8) << 6
            | (self.rsv2 as u8) << 5
            | (self.rsv3 as u8) << 4
            | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len <= u16::MAX as usize {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        match self.mask {
            Some(mask) => {
                head[1] |= 0x80;
                head[size..size + 4].copy_from_slice(&mask);
                size + 4
            }
            None => size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_reserved_opcodes() {
            for byte in (0x3..=0x7).chain(0xB..=0xF) {
                assert!(matches!(
                    OpCode::try_from(byte),
                    Err(WebSocketError::InvalidOpCode(b)) if b == byte
                ));
            }
        }

        #[test]
        fn test_byte_conversion() {
            for opcode in [
                OpCode::Continuation,
                OpCode::Text,
                OpCode::Binary,
                OpCode::Close,
                OpCode::Ping,
                OpCode::Pong,
            ] {
                assert_eq!(OpCode::try_from(u8::from(opcode)).unwrap(), opcode);
            }
        }
    }

    mod frame_tests {
        use super::*;

        fn head(frame: &Frame) -> Vec<u8> {
            let mut head = [0; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head);
            head[..size].to_vec()
        }

        #[test]
        fn test_short_head() {
            assert_eq!(head(&Frame::text("hi")), [0x81, 0x02]);
            assert_eq!(
                head(&Frame::new(false, OpCode::Binary, None, &b""[..])),
                [0x02, 0x00]
            );
        }

        #[test]
        fn test_extended_lengths() {
            let frame = Frame::binary(vec![0; 126]);
            assert_eq!(head(&frame), [0x82, 126, 0x00, 0x7e]);

            let frame = Frame::binary(vec![0; 65535]);
            assert_eq!(head(&frame), [0x82, 126, 0xff, 0xff]);

            let frame = Frame::binary(vec![0; 65536]);
            assert_eq!(head(&frame), [0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
        }

        #[test]
        fn test_mask_and_rsv_bits() {
            let frame = Frame::compress(true, OpCode::Text, Some([1, 2, 3, 4]), &b"x"[..]);
            assert_eq!(head(&frame), [0xc1, 0x81, 1, 2, 3, 4]);

            let frame = Frame::ping(&b""[..]).with_reserved_bits(true, true);
            assert_eq!(head(&frame), [0xb9, 0x00]);
        }

        #[test]
        fn test_close_frame() {
            let frame = Frame::close(CloseCode::Normal, "bye");
            assert_eq!(frame.opcode, OpCode::Close);
            assert_eq!(frame.payload.close_code().unwrap(), CloseCode::Normal);
            assert_eq!(frame.payload.close_reason().unwrap(), "bye");
        }

        #[test]
        fn test_builders() {
            let frame = Frame::text("abc").with_fin(false).with_mask([9; 4]);
            assert!(!frame.fin);
            assert!(frame.is_masked());
            assert_eq!(frame.mask(), Some([9; 4]));
            assert!(frame.is_utf8());
            assert!(!Frame::binary(vec![0xff]).is_utf8());
        }
    }
}
