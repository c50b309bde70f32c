//! Frame codec for `tokio_util::codec` framed transports.
//!
//! The [`Decoder`] is a resumable state machine: a frame split across any number of reads is decoded once
//! all of its bytes are buffered, and every header field is validated as soon as it is available. The
//! [`Encoder`] writes the header and the masked payload in one pass.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_HEAD_SIZE},
    mask::apply_mask,
    payload::Payload,
    Role, WebSocketError,
};

/// Largest payload allowed in a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// The first two bytes were read, waiting for the extended length and mask.
    Header(Header),
    /// Waiting for `payload_len` bytes of payload.
    Payload(HeaderAndMask),
}

/// Fields of the first two header bytes.
struct Header {
    fin: bool,
    rsv1: bool,
    masked: bool,
    opcode: OpCode,
    /// Size of the extended length field (0, 2 or 8).
    extra: usize,
    /// 7-bit length indicator.
    length_code: u8,
    /// Bytes remaining before the payload.
    header_size: usize,
}

struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A combined codec that provides both encoding and decoding of WebSocket frames, usable with
/// [`tokio_util::codec::Framed`].
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec for an endpoint playing `role`.
    pub fn new(role: Role, max_payload_read: usize, compression: bool) -> Self {
        Self {
            decoder: Decoder::new(role, max_payload_read, compression),
            encoder: Encoder::new(role),
        }
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// Decoder of inbound frames for an endpoint playing `role`.
///
/// A server only accepts masked frames and a client only unmasked ones. RSV1 is accepted on the first
/// frame of a data message only when permessage-deflate was negotiated.
pub struct Decoder {
    role: Role,
    /// Current reading state (header or payload).
    state: Option<ReadState>,
    /// Maximum allowed size for a frame payload.
    max_payload_size: usize,
    /// Whether permessage-deflate was negotiated.
    compression: bool,
}

impl Decoder {
    /// Creates a new `Decoder`.
    ///
    /// # Parameters
    /// - `role`: The role of the local endpoint; decides the masking direction accepted.
    /// - `max_payload_size`: The maximum allowed payload size, in bytes.
    /// - `compression`: Whether RSV1 is meaningful on this connection.
    pub fn new(role: Role, max_payload_size: usize, compression: bool) -> Self {
        Self {
            role,
            state: None,
            max_payload_size,
            compression,
        }
    }

    fn check_header(&self, header: &Header) -> Result<(), WebSocketError> {
        match (self.role, header.masked) {
            (Role::Server, false) => return Err(WebSocketError::UnmaskedFrame),
            (Role::Client, true) => return Err(WebSocketError::MaskedFrame),
            _ => {}
        }

        if header.opcode.is_control() {
            if header.rsv1 {
                return Err(WebSocketError::ReservedBitsNotZero);
            }
            if !header.fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if usize::from(header.length_code) > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        } else if header.rsv1 {
            if header.opcode == OpCode::Continuation {
                return Err(WebSocketError::ReservedBitsNotZero);
            }
            if !self.compression {
                return Err(WebSocketError::CompressionNotSupported);
            }
        }

        Ok(())
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes one frame from `src`.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))` with the unmasked payload once the whole frame is buffered.
    /// - `Ok(None)` when more data is needed.
    /// - `Err(WebSocketError)` on a protocol violation. The decoder must not be used afterwards.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    if src[0] & 0b0011_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv1 = src[0] & 0b0100_0000 != 0;
                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };

                    let header = Header {
                        fin,
                        rsv1,
                        masked,
                        opcode,
                        extra,
                        length_code,
                        header_size: extra + masked as usize * 4,
                    };
                    self.check_header(&header)?;

                    src.advance(2);
                    self.state = Some(ReadState::Header(header));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        2 => usize::from(src.get_u16()),
                        8 => {
                            usize::try_from(src.get_u64()).map_err(|_| WebSocketError::FrameTooLarge)?
                        }
                        _ => usize::from(header.length_code),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        src.reserve(header_and_mask.payload_len - src.remaining());
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    } = header_and_mask;

                    let mut payload = src.split_to(payload_len);
                    if let Some(mask) = mask {
                        apply_mask(&mut payload, mask);
                    }

                    let mut frame = Frame::new(header.fin, header.opcode, mask, Payload::from(payload));
                    frame.is_compressed = header.rsv1;

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// Encoder of outbound frames for an endpoint playing `role`.
///
/// A client masks every frame, with a fresh random key unless the frame already carries one. A server
/// never masks.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.mask = match self.role {
            Role::Client => Some(frame.mask.unwrap_or_else(rand::random)),
            Role::Server => None,
        };

        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = frame.mask {
            apply_mask(&mut dst[start..], mask);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::CloseCode;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    const MAX: usize = 1 << 20;

    fn encode(role: Role, frame: Frame) -> BytesMut {
        let mut dst = BytesMut::new();
        Encoder::new(role).encode(frame, &mut dst).unwrap();
        dst
    }

    fn decode(role: Role, src: &mut BytesMut) -> Result<Option<Frame>, WebSocketError> {
        Decoder::new(role, MAX, false).decode(src)
    }

    #[test]
    fn test_roundtrip_lengths() {
        for len in [0, 1, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            for opcode in [OpCode::Text, OpCode::Binary, OpCode::Continuation] {
                let frame = Frame::new(true, opcode, Some([1, 2, 3, 4]), payload.clone());
                let mut buf = encode(Role::Client, frame.clone());
                assert_eq!(decode(Role::Server, &mut buf).unwrap(), Some(frame));
                assert!(buf.is_empty());

                let frame = Frame::new(false, opcode, None, payload.clone());
                let mut buf = encode(Role::Server, frame.clone());
                assert_eq!(decode(Role::Client, &mut buf).unwrap(), Some(frame));
            }
        }
    }

    #[test]
    fn test_roundtrip_control() {
        let frames = [
            Frame::ping(vec![7; 125]),
            Frame::pong(&b""[..]),
            Frame::close(CloseCode::Away, "bye"),
            Frame::close_raw(&b""[..]),
        ];
        for frame in frames {
            let mut buf = encode(Role::Server, frame.clone());
            assert_eq!(decode(Role::Client, &mut buf).unwrap(), Some(frame));
        }
    }

    #[test]
    fn test_client_generates_mask() {
        let mut buf = encode(Role::Client, Frame::text("hello"));
        assert_ne!(buf[1] & 0x80, 0);
        let frame = decode(Role::Server, &mut buf).unwrap().unwrap();
        assert!(frame.is_masked());
        assert_eq!(&*frame.payload, b"hello");
    }

    #[test]
    fn test_server_strips_mask() {
        let buf = encode(Role::Server, Frame::text("hello").with_mask([1, 1, 1, 1]));
        assert_eq!(&buf[..], b"\x81\x05hello");
    }

    #[test]
    fn test_partial_reads() {
        let frame = Frame::binary(vec![0xab; 300]).with_mask([4, 3, 2, 1]);
        let encoded = encode(Role::Client, frame.clone());

        let mut decoder = Decoder::new(Role::Server, MAX, false);
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for byte in encoded.iter() {
            assert!(decoded.is_none());
            buf.extend_from_slice(&[*byte]);
            decoded = decoder.decode(&mut buf).unwrap();
        }
        assert_eq!(decoded, Some(frame));
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = encode(Role::Server, Frame::text("one"));
        buf.extend_from_slice(&encode(Role::Server, Frame::text("two")));

        let mut decoder = Decoder::new(Role::Client, MAX, false);
        let first = decoder.decode(&mut buf).unwrap().unwrap();
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&*first.payload, b"one");
        assert_eq!(&*second.payload, b"two");
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_masking_direction() {
        let mut unmasked = encode(Role::Server, Frame::text("x"));
        assert!(matches!(
            decode(Role::Server, &mut unmasked),
            Err(WebSocketError::UnmaskedFrame)
        ));

        let mut masked = encode(Role::Client, Frame::text("x"));
        assert!(matches!(
            decode(Role::Client, &mut masked),
            Err(WebSocketError::MaskedFrame)
        ));
    }

    #[test]
    fn test_reserved_bits() {
        let mut buf = encode(Role::Server, Frame::text("x").with_reserved_bits(true, false));
        assert!(matches!(
            decode(Role::Client, &mut buf),
            Err(WebSocketError::ReservedBitsNotZero)
        ));

        let mut buf = encode(Role::Server, Frame::compress(true, OpCode::Text, None, &b"x"[..]));
        assert!(matches!(
            decode(Role::Client, &mut buf),
            Err(WebSocketError::CompressionNotSupported)
        ));

        let mut buf = encode(Role::Server, Frame::compress(true, OpCode::Text, None, &b"x"[..]));
        let frame = Decoder::new(Role::Client, MAX, true).decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_compressed());

        let mut buf = encode(Role::Server, Frame::compress(true, OpCode::Ping, None, &b""[..]));
        assert!(matches!(
            Decoder::new(Role::Client, MAX, true).decode(&mut buf),
            Err(WebSocketError::ReservedBitsNotZero)
        ));

        let mut buf = encode(
            Role::Server,
            Frame::compress(true, OpCode::Continuation, None, &b""[..]),
        );
        assert!(matches!(
            Decoder::new(Role::Client, MAX, true).decode(&mut buf),
            Err(WebSocketError::ReservedBitsNotZero)
        ));
    }

    #[test]
    fn test_control_frame_rules() {
        let mut buf = encode(Role::Server, Frame::ping(&b""[..]).with_fin(false));
        assert!(matches!(
            decode(Role::Client, &mut buf),
            Err(WebSocketError::ControlFrameFragmented)
        ));

        let mut buf = encode(Role::Server, Frame::pong(vec![0; 126]));
        assert!(matches!(
            decode(Role::Client, &mut buf),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }

    #[test]
    fn test_reserved_opcode() {
        let mut buf = BytesMut::from(&[0x83, 0x00][..]);
        assert!(matches!(
            decode(Role::Client, &mut buf),
            Err(WebSocketError::InvalidOpCode(3))
        ));
    }

    #[test]
    fn test_payload_limit() {
        let mut decoder = Decoder::new(Role::Client, 16, false);

        let mut buf = encode(Role::Server, Frame::binary(vec![0; 16]));
        assert!(decoder.decode(&mut buf).unwrap().is_some());

        let mut buf = encode(Role::Server, Frame::binary(vec![0; 17]));
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::FrameTooLarge)
        ));
    }

    #[test]
    fn test_huge_declared_length() {
        let mut buf = BytesMut::from(&[0x82, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff][..]);
        assert!(matches!(
            decode(Role::Client, &mut buf),
            Err(WebSocketError::FrameTooLarge)
        ));
    }
}
