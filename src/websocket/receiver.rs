//! The receive loop of a connection and the task supervising it.
use std::{any::Any, io, sync::Arc};

use futures::StreamExt;
use tokio::{io::ReadHalf, task::JoinHandle, time::timeout};
use tokio_util::codec::FramedRead;

use super::{lock, CloseEvent, Event, Shared};
use crate::{
    close::CloseCode,
    codec::Decoder,
    fragment::Assembler,
    frame::{Frame, OpCode},
    payload::{truncate_reason, Payload},
    stream::BoxedTransport,
    Role, WebSocketError,
};

/// The read half of a connection.
pub(crate) struct Reader {
    pub stream: FramedRead<ReadHalf<BoxedTransport>, Decoder>,
    pub assembler: Assembler,
}

/// Why the receive loop stopped.
enum Exit {
    /// The peer sent a valid close frame.
    Close(Payload),
    /// The transport reached end of file.
    Eof,
    Io(io::Error),
    /// The peer broke the protocol, or the loop itself failed.
    Failed(WebSocketError),
}

/// The close code of a connection failed by `err`.
pub(crate) fn fatal_code(err: &WebSocketError, role: Role) -> CloseCode {
    match err {
        WebSocketError::InvalidUTF8 => CloseCode::Invalid,
        WebSocketError::FrameTooLarge | WebSocketError::MessageTooLarge => CloseCode::Size,
        err if err.is_protocol_error() => CloseCode::Protocol,
        _ => match role {
            Role::Server => CloseCode::Error,
            Role::Client => CloseCode::Policy,
        },
    }
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_owned()
    }
}

/// Checks a received close payload: no 1-byte payload, a code that may appear on the wire and a
/// UTF-8 reason.
fn validate_close(payload: &Payload) -> Result<(), WebSocketError> {
    if payload.is_empty() {
        return Ok(());
    }

    let code = payload.close_code()?;
    if !code.is_allowed() {
        return Err(WebSocketError::InvalidCloseCode(code.into()));
    }
    payload.close_reason()?;
    Ok(())
}

impl Shared {
    /// Spawns the receive loop of session `epoch` under a supervisor.
    pub(super) fn spawn_receiver(self: &Arc<Self>, epoch: u64, reader: Reader) -> tokio::task::AbortHandle {
        let inner = tokio::spawn(Arc::clone(self).receive(epoch, reader));
        let abort = inner.abort_handle();
        tokio::spawn(Arc::clone(self).supervise(epoch, inner));
        abort
    }

    async fn receive(self: Arc<Self>, epoch: u64, mut reader: Reader) -> Exit {
        loop {
            let frame = match reader.stream.next().await {
                None => return Exit::Eof,
                Some(Err(WebSocketError::IoError(err))) => return Exit::Io(err),
                Some(Err(err)) => return Exit::Failed(err),
                Some(Ok(frame)) => frame,
            };

            match frame.opcode {
                OpCode::Close => {
                    if let Err(err) = validate_close(&frame.payload) {
                        return Exit::Failed(err);
                    }
                    return Exit::Close(frame.payload);
                }
                OpCode::Ping => self.on_ping(epoch, frame),
                OpCode::Pong => self.on_pong(frame),
                _ => match reader.assembler.push(frame) {
                    Ok(Some(message)) => {
                        self.emit(epoch, Event::Message(message));
                    }
                    Ok(None) => {}
                    Err(err) => return Exit::Failed(err),
                },
            }
        }
    }

    fn on_ping(self: &Arc<Self>, epoch: u64, frame: Frame) {
        let payload = frame.payload.into_bytes();
        if self.options.emit_on_ping {
            self.emit(epoch, Event::Ping(payload.clone()));
        }

        // a sender blocked on a full transport must not stall reading
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = shared.send_control(Frame::pong(payload)).await {
                #[cfg(feature = "logging")]
                log::debug!("{} could not answer ping: {err}", shared.role);
                #[cfg(not(feature = "logging"))]
                let _ = err;
            }
        });
    }

    fn on_pong(&self, frame: Frame) {
        let mut pending = lock(&self.pending_pong);
        let matches = pending
            .as_ref()
            .is_some_and(|pending| pending.payload[..] == frame.payload[..]);
        if matches {
            if let Some(pending) = pending.take() {
                let _ = pending.tx.send(());
            }
        }
    }

    async fn supervise(self: Arc<Self>, epoch: u64, inner: JoinHandle<Exit>) {
        let exit = match inner.await {
            Ok(exit) => exit,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                let message = panic_message(err.into_panic().as_ref());
                Exit::Failed(WebSocketError::Internal(format!("receive loop panicked: {message}")))
            }
        };

        match exit {
            Exit::Close(payload) => self.on_close_frame(epoch, payload).await,
            Exit::Eof => self.on_eof(epoch, None).await,
            Exit::Io(err) => self.on_eof(epoch, Some(err)).await,
            Exit::Failed(err) => self.fail(epoch, err).await,
        }
    }

    /// The peer started the close handshake, or answered ours.
    async fn on_close_frame(&self, epoch: u64, payload: Payload) {
        let code = payload.close_code().unwrap_or(CloseCode::Status);
        let reason = payload.close_reason().unwrap_or_default().to_owned();

        #[cfg(feature = "logging")]
        log::debug!("{} received close: code={code} reason={reason:?}", self.role);

        {
            let mut session = self.session();
            if session.epoch != epoch {
                return;
            }
            session.close_received = Some((code, reason.clone()));
        }

        if !self.begin_closing(epoch) {
            // a local close is waiting for this
            self.signal_exit(epoch);
            return;
        }

        let echo_code = if code.is_allowed() { code } else { CloseCode::Status };
        let sent = matches!(
            timeout(self.options.wait_time, self.send_control(Frame::close(echo_code, ""))).await,
            Ok(Ok(()))
        );
        self.signal_exit(epoch);
        self.finish(
            epoch,
            CloseEvent {
                code,
                reason,
                was_clean: sent,
            },
        )
        .await;
    }

    /// The transport ended without a close frame.
    async fn on_eof(&self, epoch: u64, err: Option<io::Error>) {
        if let Some(err) = err {
            #[cfg(feature = "logging")]
            log::warn!("{} transport failed: {err}", self.role);
            self.emit(epoch, Event::Error(WebSocketError::IoError(err)));
        }

        let was_open = self.begin_closing(epoch);
        self.signal_exit(epoch);
        if was_open {
            self.finish(epoch, CloseEvent::abnormal()).await;
        }
    }

    /// Fails the connection: reports `err`, sends a close frame with the mapped code and tears the
    /// session down without waiting for the peer.
    pub(super) async fn fail(&self, epoch: u64, err: WebSocketError) {
        let code = fatal_code(&err, self.role);
        let reason = truncate_reason(&err.to_string()).to_owned();

        #[cfg(feature = "logging")]
        log::warn!("{} failing connection with {code}: {reason}", self.role);

        if !self.emit(epoch, Event::Error(err)) {
            return;
        }

        if self.begin_closing(epoch) {
            let _ = timeout(
                self.options.wait_time,
                self.send_control(Frame::close(code, &reason)),
            )
            .await;
        }
        self.signal_exit(epoch);
        self.finish(
            epoch,
            CloseEvent {
                code,
                reason,
                was_clean: false,
            },
        )
        .await;
    }
}
