use std::fmt;

use bytes::Bytes;

use crate::{close::CloseCode, frame::OpCode, WebSocketError};

/// A complete data message, reassembled from one or more frames and decompressed.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    opcode: OpCode,
    data: Bytes,
}

impl Message {
    /// Creates a message. Only [`OpCode::Text`] and [`OpCode::Binary`] messages can be sent.
    pub fn new(opcode: OpCode, data: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            data: data.into(),
        }
    }

    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    #[inline]
    pub fn is_text(&self) -> bool {
        self.opcode == OpCode::Text
    }

    #[inline]
    pub fn is_binary(&self) -> bool {
        self.opcode == OpCode::Binary
    }

    /// The raw message bytes.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The UTF-8 view of a text message. `None` for binary messages and for text that is not valid
    /// UTF-8, which can only be delivered when validation is disabled.
    pub fn as_text(&self) -> Option<&str> {
        if !self.is_text() {
            return None;
        }
        std::str::from_utf8(&self.data).ok()
    }

    /// Like [`Message::as_text`], falling back to an empty string.
    pub fn text(&self) -> &str {
        self.as_text().unwrap_or_default()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => write!(f, "Message::Text({text:?})"),
            None => write!(f, "Message::{:?}({} bytes)", self.opcode, self.data.len()),
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::new(OpCode::Text, Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::new(OpCode::Text, text)
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Self::new(OpCode::Binary, data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::new(OpCode::Binary, data)
    }
}

impl From<&[u8]> for Message {
    fn from(data: &[u8]) -> Self {
        Self::new(OpCode::Binary, Bytes::copy_from_slice(data))
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// The code received from the peer, the code of a fatal error, or [`CloseCode::Abnormal`] when no
    /// close handshake took place.
    pub code: CloseCode,
    pub reason: String,
    /// Whether both close frames were exchanged.
    pub was_clean: bool,
}

impl CloseEvent {
    pub(crate) fn abnormal() -> Self {
        Self {
            code: CloseCode::Abnormal,
            reason: String::new(),
            was_clean: false,
        }
    }
}

/// Something that happened on a connection, delivered in order by [`WebSocket::recv`](crate::WebSocket::recv).
///
/// Every session yields exactly one [`Event::Close`], always last. [`Event::Open`] precedes any message
/// unless the handshake failed.
#[derive(Debug)]
pub enum Event {
    /// The handshake completed.
    Open,
    /// A data message arrived.
    Message(Message),
    /// A ping arrived and was answered. Only reported with [`Options::emit_on_ping`](crate::Options::emit_on_ping).
    Ping(Bytes),
    /// The connection failed. Followed by the `Close` event.
    Error(WebSocketError),
    /// The session ended.
    Close(CloseEvent),
}
