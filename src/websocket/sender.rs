//! The write half of a connection.
use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio_util::codec::{Encoder as _, FramedWrite};

use crate::{
    codec::Encoder,
    compression::Compressor,
    frame::{Frame, OpCode},
    stream::BoxedTransport,
    Result, Role, WebSocketError,
};

/// Owns the write half of the transport. Only ever used behind the send lock, so the frames of one
/// message are contiguous on the wire.
pub(crate) struct Writer {
    /// Session the writer belongs to.
    pub epoch: u64,
    sink: FramedWrite<WriteHalf<BoxedTransport>, Encoder>,
    /// Encodes whole messages straight into the write buffer of `sink`.
    encoder: Encoder,
    deflate: Option<Compressor>,
    fragment_size: usize,
    /// Set once a close frame was written; nothing may follow it.
    closed: bool,
}

impl Writer {
    pub fn new(
        epoch: u64,
        io: WriteHalf<BoxedTransport>,
        role: Role,
        deflate: Option<Compressor>,
        fragment_size: usize,
    ) -> Self {
        Self {
            epoch,
            sink: FramedWrite::new(io, Encoder::new(role)),
            encoder: Encoder::new(role),
            deflate,
            fragment_size: fragment_size.max(1),
            closed: false,
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Writes a single control frame and flushes it.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        if self.closed {
            return Err(WebSocketError::ConnectionClosed);
        }
        if frame.opcode == OpCode::Close {
            self.closed = true;
        }
        self.sink.send(frame).await
    }

    /// Compresses `data` when deflate was negotiated and writes it fragmented at the configured size.
    ///
    /// Every frame of the message is encoded into the write buffer before the first await. A send
    /// dropped while flushing leaves the rest of the message buffered, and the next write flushes it
    /// first.
    pub async fn send_message(&mut self, opcode: OpCode, data: Bytes) -> Result<()> {
        if self.closed {
            return Err(WebSocketError::ConnectionClosed);
        }

        let (data, compressed) = match self.deflate.as_mut() {
            Some(deflate) => (deflate.compress(&data)?, true),
            None => (data, false),
        };

        let buf = self.sink.write_buffer_mut();
        let mut offset = 0;
        let mut first = true;
        loop {
            let end = usize::min(offset + self.fragment_size, data.len());
            let fin = end == data.len();
            let chunk = data.slice(offset..end);

            let frame = match (first, compressed) {
                (true, true) => Frame::compress(fin, opcode, None, chunk),
                (true, false) => Frame::new(fin, opcode, None, chunk),
                (false, _) => Frame::continuation(fin, chunk),
            };
            self.encoder.encode(frame, buf)?;

            if fin {
                break;
            }
            offset = end;
            first = false;
        }

        self.sink.flush().await
    }

    /// Flushes pending frames and shuts the transport down for writing.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        self.sink.flush().await?;
        self.sink.get_mut().shutdown().await?;
        Ok(())
    }
}
