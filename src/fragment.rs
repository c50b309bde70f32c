//! Reassembly of fragmented data messages.
use bytes::BytesMut;

use crate::{
    compression::Decompressor,
    frame::{Frame, OpCode},
    Message, Result, WebSocketError,
};

/// The message currently being reassembled.
struct Fragment {
    opcode: OpCode,
    is_compressed: bool,
}

/// Turns a sequence of data frames into messages.
///
/// The first frame of a message carries its opcode; every following frame up to the one with FIN set must
/// be a continuation. Control frames never reach the assembler.
pub(crate) struct Assembler {
    fragment: Option<Fragment>,
    accumulated: BytesMut,
    inflate: Option<Decompressor>,
    max_message_size: usize,
    check_utf8: bool,
}

impl Assembler {
    pub fn new(inflate: Option<Decompressor>, max_message_size: usize, check_utf8: bool) -> Self {
        Self {
            fragment: None,
            accumulated: BytesMut::new(),
            inflate,
            max_message_size,
            check_utf8,
        }
    }

    /// Whether a fragmented message is open.
    #[cfg(test)]
    pub fn in_continuation(&self) -> bool {
        self.fragment.is_some()
    }

    /// Feeds one data frame, returning a message once its last frame arrived.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }

                if frame.fin {
                    let data = frame.payload.into_bytes();
                    if data.len() > self.max_message_size {
                        return Err(WebSocketError::MessageTooLarge);
                    }
                    return self
                        .finish(frame.opcode, frame.is_compressed, &data)
                        .map(Some);
                }

                self.check_size(frame.payload.len())?;
                self.fragment = Some(Fragment {
                    opcode: frame.opcode,
                    is_compressed: frame.is_compressed,
                });
                self.accumulated.extend_from_slice(&frame.payload);
                Ok(None)
            }
            OpCode::Continuation => {
                if self.fragment.is_none() {
                    return Err(WebSocketError::InvalidContinuationFrame);
                }

                self.check_size(frame.payload.len())?;
                self.accumulated.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }

                let Some(fragment) = self.fragment.take() else {
                    return Err(WebSocketError::InvalidContinuationFrame);
                };
                let data = std::mem::take(&mut self.accumulated);
                self.finish(fragment.opcode, fragment.is_compressed, &data)
                    .map(Some)
            }
            _ => Err(WebSocketError::InvalidOpCode(frame.opcode.into())),
        }
    }

    fn check_size(&self, incoming: usize) -> Result<()> {
        if self.accumulated.len() + incoming > self.max_message_size {
            return Err(WebSocketError::MessageTooLarge);
        }
        Ok(())
    }

    fn finish(&mut self, opcode: OpCode, is_compressed: bool, data: &[u8]) -> Result<Message> {
        let data = if is_compressed {
            let inflate = self
                .inflate
                .as_mut()
                .ok_or(WebSocketError::CompressionNotSupported)?;
            inflate.decompress(data, self.max_message_size)?
        } else {
            bytes::Bytes::copy_from_slice(data)
        };

        if opcode == OpCode::Text && self.check_utf8 && !is_utf8(&data) {
            return Err(WebSocketError::InvalidUTF8);
        }

        Ok(Message::new(opcode, data))
    }
}

#[inline]
fn is_utf8(data: &[u8]) -> bool {
    #[cfg(feature = "simd")]
    {
        simdutf8::basic::from_utf8(data).is_ok()
    }
    #[cfg(not(feature = "simd"))]
    {
        std::str::from_utf8(data).is_ok()
    }
}
