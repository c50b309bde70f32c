//! Frame and message payloads.
//!
//! A [`Payload`] is an immutable buffer whose first `extension_data_length` bytes belong to a negotiated
//! extension and whose remainder is application data. Close frames further split the application data
//! into a big-endian status code and a UTF-8 reason.
use std::{fmt, ops::Deref};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{close::CloseCode, Result, WebSocketError};

/// Maximum length of a close reason, so that code and reason fit in a 125 byte control frame.
pub const MAX_CLOSE_REASON: usize = 123;

/// Payload of a WebSocket frame or message.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Payload {
    data: Bytes,
    extension_data_length: usize,
}

impl Payload {
    /// Creates a payload made only of application data.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            extension_data_length: 0,
        }
    }

    /// Creates a payload whose first `extension_data_length` bytes are extension data.
    ///
    /// The length is clamped to the size of `data`.
    pub fn with_extension_data(data: impl Into<Bytes>, extension_data_length: usize) -> Self {
        let data = data.into();
        let extension_data_length = extension_data_length.min(data.len());
        Self {
            data,
            extension_data_length,
        }
    }

    /// Copies `data` into a new payload.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(data))
    }

    /// Encodes a close frame payload.
    ///
    /// [`CloseCode::Status`] has no wire form and produces an empty payload. The reason is truncated
    /// to [`MAX_CLOSE_REASON`] bytes on a character boundary.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        if code == CloseCode::Status {
            return Self::default();
        }

        let reason = truncate_reason(reason);
        let mut data = BytesMut::with_capacity(2 + reason.len());
        data.put_u16(code.into());
        data.extend_from_slice(reason.as_bytes());
        Self::new(data.freeze())
    }

    /// Bytes owned by a negotiated extension.
    pub fn extension_data(&self) -> &[u8] {
        &self.data[..self.extension_data_length]
    }

    /// Bytes owned by the application.
    pub fn application_data(&self) -> &[u8] {
        &self.data[self.extension_data_length..]
    }

    /// Status code of a close payload.
    ///
    /// An empty payload reads as [`CloseCode::Status`]; a 1 byte payload is malformed.
    pub fn close_code(&self) -> Result<CloseCode> {
        match self.application_data() {
            [] => Ok(CloseCode::Status),
            [_] => Err(WebSocketError::InvalidCloseFrame),
            [hi, lo, ..] => Ok(CloseCode::from(u16::from_be_bytes([*hi, *lo]))),
        }
    }

    /// Reason of a close payload, empty when the payload carries no reason.
    pub fn close_reason(&self) -> Result<&str> {
        let data = self.application_data();
        if data.len() <= 2 {
            return Ok("");
        }
        std::str::from_utf8(&data[2..]).map_err(|_| WebSocketError::InvalidUTF8)
    }

    /// Returns the underlying buffer, extension data included.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Cuts `reason` to at most [`MAX_CLOSE_REASON`] bytes without splitting a character.
pub(crate) fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.data.len())
            .field("extension_data_length", &self.extension_data_length)
            .finish()
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<BytesMut> for Payload {
    fn from(data: BytesMut) -> Self {
        Self::new(data.freeze())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<String> for Payload {
    fn from(data: String) -> Self {
        Self::new(data)
    }
}

impl From<&'static [u8]> for Payload {
    fn from(data: &'static [u8]) -> Self {
        Self::new(data)
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Self::new(data)
    }
}

impl From<Payload> for Bytes {
    fn from(payload: Payload) -> Self {
        payload.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_split() {
        let payload = Payload::with_extension_data(&b"extapp"[..], 3);
        assert_eq!(payload.extension_data(), b"ext");
        assert_eq!(payload.application_data(), b"app");
        assert_eq!(&*payload, b"extapp");

        let clamped = Payload::with_extension_data(&b"ab"[..], 10);
        assert_eq!(clamped.extension_data(), b"ab");
        assert!(clamped.application_data().is_empty());
    }

    #[test]
    fn test_close_payload() {
        let payload = Payload::close(CloseCode::Away, "bye");
        assert_eq!(&*payload, &[0x03, 0xe9, b'b', b'y', b'e']);
        assert_eq!(payload.close_code().unwrap(), CloseCode::Away);
        assert_eq!(payload.close_reason().unwrap(), "bye");
    }

    #[test]
    fn test_no_status_is_empty() {
        let payload = Payload::close(CloseCode::Status, "ignored");
        assert!(payload.is_empty());
        assert_eq!(payload.close_code().unwrap(), CloseCode::Status);
        assert_eq!(payload.close_reason().unwrap(), "");
    }

    #[test]
    fn test_one_byte_close_is_invalid() {
        let payload = Payload::from(&[0x03][..]);
        assert!(matches!(
            payload.close_code(),
            Err(WebSocketError::InvalidCloseFrame)
        ));
    }

    #[test]
    fn test_invalid_reason() {
        let payload = Payload::from(vec![0x03, 0xe8, 0xff, 0xfe]);
        assert!(matches!(
            payload.close_reason(),
            Err(WebSocketError::InvalidUTF8)
        ));
    }

    #[test]
    fn test_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let payload = Payload::close(CloseCode::Normal, &reason);
        assert!(payload.len() <= 125);
        let decoded = payload.close_reason().unwrap();
        assert_eq!(decoded.len(), 122);
        assert!(decoded.chars().all(|c| c == 'é'));
    }
}
