//! The per-connection engine.
//!
//! A [`WebSocket`] is a handle to shared connection state. Three locks guard that state and are never
//! nested:
//!
//! - the state lock (a `std` mutex, never held across an await) owns the ready state and the event queue
//!   producer side, so a transition and the event announcing it happen atomically
//! - the send lock owns the write half of the transport
//! - the ping lock serializes pings
//!
//! The read half belongs to the receive loop, spawned when the session opens and supervised by a second
//! task that turns its outcome (close frame, end of stream, protocol error or panic) into the close
//! handshake.
mod builder;
mod event;
mod options;
mod receiver;
mod sender;
mod upgrade;

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot, watch, Mutex as AsyncMutex},
    task::AbortHandle,
    time::timeout,
};
use tokio_rustls::TlsConnector;
use tokio_util::codec::FramedRead;
use url::Url;

pub use builder::WebSocketBuilder;
pub use event::{CloseEvent, Event, Message};
pub use options::{
    Options, FRAGMENT_SIZE, HANDSHAKE_TIMEOUT, MAX_MESSAGE_SIZE, MAX_PAYLOAD_READ, MAX_RETRIES, WAIT_TIME,
};
pub use upgrade::UpgradeFut;

pub use crate::compression::CompressionMethod;
pub use crate::stream::{MaybeTlsStream, Transport};

pub(crate) use receiver::panic_message;

use crate::{
    close::CloseCode,
    codec::{Decoder, MAX_CONTROL_PAYLOAD},
    fragment::Assembler,
    frame::{Frame, OpCode},
    handshake::{self, HttpRequest, Negotiation},
    payload::{truncate_reason, MAX_CLOSE_REASON},
    stream::{self as transport, BoxedTransport},
    Result, WebSocketError,
};
use receiver::Reader;
use sender::Writer;

/// The lifecycle of a connection.
///
/// `Connecting -> Open -> Closing -> Closed`. A client may go from `Closed` back to `Connecting` through
/// [`WebSocket::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// The handshake has not completed yet.
    Connecting,
    /// Messages can be exchanged.
    Open,
    /// A close frame was sent or received.
    Closing,
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// The role of the local endpoint. Clients mask the frames they send, servers do not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Locks a `std` mutex, ignoring poisoning: every critical section leaves the data consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State owned by the state lock.
struct Session {
    ready_state: ReadyState,
    /// Incremented for every session of a reconnecting client. Tasks and writers of a previous session
    /// carry an older value and are ignored.
    epoch: u64,
    /// A connect or accept is running.
    handshaking: bool,
    /// Consecutive reconnects without reaching `Open`.
    reconnects: usize,
    protocol: Option<String>,
    compression: CompressionMethod,
    /// The close frame received from the peer, if any.
    close_received: Option<(CloseCode, String)>,
    receiver: Option<AbortHandle>,
}

impl Session {
    fn new() -> Self {
        Self {
            ready_state: ReadyState::Connecting,
            epoch: 0,
            handshaking: false,
            reconnects: 0,
            protocol: None,
            compression: CompressionMethod::None,
            close_received: None,
            receiver: None,
        }
    }

    fn restart(&mut self) {
        self.ready_state = ReadyState::Connecting;
        self.epoch += 1;
        self.protocol = None;
        self.compression = CompressionMethod::None;
        self.close_received = None;
    }
}

/// A ping waiting for its pong.
struct PendingPong {
    payload: Bytes,
    tx: oneshot::Sender<()>,
}

/// What a client needs to (re)connect.
pub(crate) struct Dial {
    url: Mutex<Url>,
    headers: HeaderMap,
    connector: Option<TlsConnector>,
    tcp_address: Option<SocketAddr>,
    /// Transport provided for the first handshake.
    io: Mutex<Option<BoxedTransport>>,
}

impl Dial {
    pub(crate) fn new(
        url: Url,
        headers: HeaderMap,
        connector: Option<TlsConnector>,
        tcp_address: Option<SocketAddr>,
        io: Option<BoxedTransport>,
    ) -> Self {
        Self {
            url: Mutex::new(url),
            headers,
            connector,
            tcp_address,
            io: Mutex::new(io),
        }
    }
}

/// An accepted transport whose handshake has not run yet.
struct Pending {
    io: BoxedTransport,
    /// The request head, when it was already read (by a router).
    request: Option<HttpRequest>,
    /// Bytes read past the request head.
    buffered: BytesMut,
}

struct Shared {
    role: Role,
    options: Options,
    state: Mutex<Session>,
    writer: AsyncMutex<Option<Writer>>,
    ping_lock: AsyncMutex<()>,
    pending_pong: Mutex<Option<PendingPong>>,
    /// Set once the receive loop of the current session stopped.
    exit: watch::Sender<bool>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: AsyncMutex<mpsc::UnboundedReceiver<Event>>,
    dial: Option<Dial>,
    pending: Mutex<Option<Pending>>,
}

/// A WebSocket connection, client or server.
///
/// Cloning is cheap and every clone refers to the same connection: one task can read events with
/// [`recv`](WebSocket::recv) while others send, ping or close.
///
/// # Example
/// ```no_run
/// use wsengine::{Event, WebSocket};
///
/// async fn run(ws: WebSocket) -> wsengine::Result<()> {
///     let sender = ws.clone();
///     tokio::spawn(async move {
///         let _ = sender.send_text("hello").await;
///     });
///
///     while let Some(event) = ws.recv().await {
///         if let Event::Message(message) = event {
///             println!("{}", message.text());
///         }
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct WebSocket {
    shared: Arc<Shared>,
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("role", &self.shared.role)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

impl WebSocket {
    fn new(
        role: Role,
        options: Options,
        dial: Option<Dial>,
        pending: Option<Pending>,
        writer: Option<Writer>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                role,
                options,
                state: Mutex::new(Session::new()),
                writer: AsyncMutex::new(writer),
                ping_lock: AsyncMutex::new(()),
                pending_pong: Mutex::new(None),
                exit,
                events_tx,
                events_rx: AsyncMutex::new(events_rx),
                dial,
                pending: Mutex::new(pending),
            }),
        }
    }

    // ================== Client ====================

    /// Starts building a client connection to `url` (`ws://` or `wss://`).
    ///
    /// Awaiting the builder connects:
    ///
    /// ```no_run
    /// use wsengine::WebSocket;
    ///
    /// async fn connect() -> wsengine::Result<()> {
    ///     let ws = WebSocket::client("ws://localhost:9001".parse()?).await?;
    ///     ws.close().await
    /// }
    /// ```
    pub fn client(url: Url) -> WebSocketBuilder {
        WebSocketBuilder::new(url)
    }

    pub(crate) fn with_dial(options: Options, dial: Dial) -> Self {
        Self::new(Role::Client, options, Some(dial), None, None)
    }

    /// Runs the client handshake.
    ///
    /// From [`ReadyState::Connecting`] this opens the session; from [`ReadyState::Closed`] it reconnects,
    /// up to [`Options::max_retries`] consecutive times. On failure the session is `Closed`, a close event
    /// is queued and the error is returned.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        let Some(dial) = shared.dial.as_ref() else {
            return Err(WebSocketError::InvalidState(self.ready_state()));
        };

        let epoch = {
            let mut session = shared.session();
            if session.handshaking {
                return Err(WebSocketError::InvalidState(session.ready_state));
            }
            match session.ready_state {
                ReadyState::Connecting => {}
                ReadyState::Closed => {
                    if session.reconnects >= shared.options.max_retries {
                        return Err(WebSocketError::RetryLimitExceeded);
                    }
                    session.reconnects += 1;
                    session.restart();
                }
                state => return Err(WebSocketError::InvalidState(state)),
            }
            session.handshaking = true;
            session.epoch
        };

        let result = timeout(shared.options.handshake_timeout, shared.client_handshake(dial))
            .await
            .unwrap_or(Err(WebSocketError::HandshakeTimeout));
        shared.session().handshaking = false;

        match result {
            Ok((io, buffered, negotiation)) => shared.open(epoch, io, buffered, negotiation).await,
            Err(err) => {
                #[cfg(feature = "logging")]
                log::warn!("client handshake failed: {err}");

                shared.settle(epoch, handshake_close(&err));
                Err(err)
            }
        }
    }

    // ================== Server ====================

    /// Wraps an accepted transport. The socket stays in [`ReadyState::Connecting`] until
    /// [`accept`](WebSocket::accept) completes the handshake.
    pub fn server(io: impl Transport, options: Options) -> Self {
        Self::new(
            Role::Server,
            options,
            None,
            Some(Pending {
                io: Box::new(io),
                request: None,
                buffered: BytesMut::new(),
            }),
            None,
        )
    }

    /// Wraps a transport whose request head was already read.
    pub(crate) fn server_with_request(
        io: BoxedTransport,
        request: HttpRequest,
        buffered: BytesMut,
        options: Options,
    ) -> Self {
        Self::new(
            Role::Server,
            options,
            None,
            Some(Pending {
                io,
                request: Some(request),
                buffered,
            }),
            None,
        )
    }

    /// An open server socket over a transport whose handshake completed elsewhere.
    pub(crate) fn upgraded(io: BoxedTransport, options: Options, negotiation: Negotiation) -> Self {
        let (reader, writer) = halves(Role::Server, &options, 0, io, BytesMut::new(), &negotiation);
        let ws = Self::new(Role::Server, options, None, None, Some(writer));
        ws.shared.launch(0, reader, &negotiation);
        ws
    }

    /// Reads the upgrade request, validates it and answers with `101 Switching Protocols`.
    ///
    /// An invalid request is answered with `400 Bad Request` (`426 Upgrade Required` for an unsupported
    /// version), the session is `Closed` and the error returned.
    pub async fn accept(&self) -> Result<()> {
        let shared = &self.shared;
        let (epoch, pending) = {
            let mut session = shared.session();
            if session.handshaking || session.ready_state != ReadyState::Connecting {
                return Err(WebSocketError::InvalidState(session.ready_state));
            }
            let Some(pending) = lock(&shared.pending).take() else {
                return Err(WebSocketError::InvalidState(session.ready_state));
            };
            session.handshaking = true;
            (session.epoch, pending)
        };

        let Pending {
            mut io,
            request,
            mut buffered,
        } = pending;
        let result = shared.server_handshake(&mut io, request, &mut buffered).await;
        shared.session().handshaking = false;

        match result {
            Ok(negotiation) => shared.open(epoch, io, buffered, negotiation).await,
            Err(err) => {
                #[cfg(feature = "logging")]
                log::warn!("server handshake failed: {err}");

                let _ = timeout(shared.options.wait_time, io.shutdown()).await;
                shared.settle(epoch, handshake_close(&err));
                Err(err)
            }
        }
    }

    // ================== Accessors ====================

    pub fn ready_state(&self) -> ReadyState {
        self.shared.session().ready_state
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// The sub-protocol selected during the handshake.
    pub fn protocol(&self) -> Option<String> {
        self.shared.session().protocol.clone()
    }

    /// The compression negotiated during the handshake.
    pub fn compression(&self) -> CompressionMethod {
        self.shared.session().compression
    }

    /// The URL of a client connection, updated when a redirect was followed.
    pub fn url(&self) -> Option<Url> {
        self.shared.dial.as_ref().map(|dial| lock(&dial.url).clone())
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Waits for the next event.
    ///
    /// Events are delivered one at a time and in order. Returns `None` once the session is `Closed` and
    /// its events were drained.
    pub async fn recv(&self) -> Option<Event> {
        let mut events = self.shared.events_rx.lock().await;
        // the close event is queued with the transition, so nothing follows it
        let closed = self.ready_state() == ReadyState::Closed;
        if let Ok(event) = events.try_recv() {
            return Some(event);
        }
        if closed {
            return None;
        }
        events.recv().await
    }

    // ================== Sending ====================

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.shared
            .send_data(OpCode::Text, Bytes::copy_from_slice(text.as_bytes()))
            .await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.shared.send_data(OpCode::Binary, data.into()).await
    }

    /// Sends a text or binary message. Any other opcode fails with
    /// [`WebSocketError::InvalidMessageOpCode`]; control frames are driven by `ping` and `close`.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        let opcode = message.opcode();
        self.shared.send_data(opcode, message.into_data()).await
    }

    /// Sends up to `len` bytes read from `reader` as one binary message.
    pub async fn send_reader<R>(&self, reader: R, len: usize) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        self.shared.check_open()?;

        let mut data = Vec::with_capacity(len.min(self.shared.options.message_limit()));
        reader.take(len as u64).read_to_end(&mut data).await?;
        if data.is_empty() {
            return Err(WebSocketError::NoData);
        }
        self.shared.send_data(OpCode::Binary, data.into()).await
    }

    // ================== Ping ====================

    /// Sends an empty ping and waits for the pong.
    pub async fn ping(&self) -> Result<bool> {
        self.ping_with(Bytes::new()).await
    }

    /// Sends a ping carrying `payload` and waits up to [`Options::wait_time`] for a pong with the same
    /// payload.
    ///
    /// Returns `Ok(false)` when no pong arrived in time, when the session closed meanwhile or when it is
    /// not open.
    pub async fn ping_with(&self, payload: impl Into<Bytes>) -> Result<bool> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        let shared = &self.shared;
        if self.ready_state() != ReadyState::Open {
            return Ok(false);
        }

        let _ping = shared.ping_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        *lock(&shared.pending_pong) = Some(PendingPong {
            payload: payload.clone(),
            tx,
        });
        // a close starting after this check releases the waiter
        if self.ready_state() != ReadyState::Open {
            shared.release_ping();
            return Ok(false);
        }

        match shared.send_control(Frame::ping(payload)).await {
            Ok(()) => {}
            Err(WebSocketError::ConnectionClosed) => {
                shared.release_ping();
                return Ok(false);
            }
            Err(err) => {
                shared.release_ping();
                return Err(err);
            }
        }

        let answered = matches!(timeout(shared.options.wait_time, rx).await, Ok(Ok(())));
        if !answered {
            shared.release_ping();
        }
        Ok(answered)
    }

    // ================== Close ====================

    /// Starts the close handshake without a status code and waits for it to complete.
    pub async fn close(&self) -> Result<()> {
        self.shared.close(CloseCode::Status, "").await
    }

    /// Starts the close handshake with `code` and `reason` and waits up to [`Options::wait_time`] for the
    /// peer to answer.
    ///
    /// Fails with [`WebSocketError::InvalidCloseCode`] for codes that may not be sent by this endpoint and
    /// with [`WebSocketError::InvalidCloseReason`] for reasons longer than 123 bytes. Closing a socket that
    /// is already closing or closed does nothing.
    pub async fn close_with(&self, code: CloseCode, reason: &str) -> Result<()> {
        if !code.is_allowed_for(self.shared.role) {
            return Err(WebSocketError::InvalidCloseCode(code.into()));
        }
        if reason.len() > MAX_CLOSE_REASON {
            return Err(WebSocketError::InvalidCloseReason);
        }
        self.shared.close(code, reason).await
    }

    /// Fails the connection with `err`, as if the peer had broken the protocol.
    pub(crate) async fn fail(&self, err: WebSocketError) {
        let epoch = self.shared.session().epoch;
        self.shared.fail(epoch, err).await;
    }
}

/// The close event of a failed handshake.
fn handshake_close(err: &WebSocketError) -> CloseEvent {
    let code = match err {
        WebSocketError::IoError(_) | WebSocketError::HandshakeTimeout => CloseCode::Abnormal,
        _ => CloseCode::Protocol,
    };
    CloseEvent {
        code,
        reason: truncate_reason(&err.to_string()).to_owned(),
        was_clean: false,
    }
}

/// Splits the transport of session `epoch` between the receive loop and the writer.
fn halves(
    role: Role,
    options: &Options,
    epoch: u64,
    io: BoxedTransport,
    buffered: BytesMut,
    negotiation: &Negotiation,
) -> (Reader, Writer) {
    let (read_half, write_half) = tokio::io::split(io);
    let (compressor, decompressor) = match negotiation.deflate(role) {
        Some((compressor, decompressor)) => (Some(compressor), Some(decompressor)),
        None => (None, None),
    };

    let decoder = Decoder::new(role, options.payload_limit(), decompressor.is_some());
    let mut stream = FramedRead::new(read_half, decoder);
    // frames the peer sent right behind the handshake
    stream.read_buffer_mut().extend_from_slice(&buffered);

    let reader = Reader {
        stream,
        assembler: Assembler::new(decompressor, options.message_limit(), options.check_utf8),
    };
    let writer = Writer::new(epoch, write_half, role, compressor, options.fragment_size);
    (reader, writer)
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.state)
    }

    /// Queues `event` unless session `epoch` is over. Returns whether it was queued.
    fn emit(&self, epoch: u64, event: Event) -> bool {
        let session = self.session();
        if session.epoch != epoch || session.ready_state == ReadyState::Closed {
            return false;
        }
        self.events_tx.send(event).is_ok()
    }

    fn check_open(&self) -> Result<()> {
        match self.session().ready_state {
            ReadyState::Open => Ok(()),
            state => Err(WebSocketError::InvalidState(state)),
        }
    }

    /// Moves session `epoch` from `Open` to `Closing`. Returns false when it was not open.
    fn begin_closing(&self, epoch: u64) -> bool {
        {
            let mut session = self.session();
            if session.epoch != epoch || session.ready_state != ReadyState::Open {
                return false;
            }
            session.ready_state = ReadyState::Closing;
        }
        self.release_ping();
        true
    }

    /// Wakes a pending ping, which then reports `false`.
    fn release_ping(&self) {
        lock(&self.pending_pong).take();
    }

    /// Signals that the receive loop of session `epoch` stopped.
    fn signal_exit(&self, epoch: u64) {
        let session = self.session();
        if session.epoch == epoch {
            self.exit.send_replace(true);
        }
    }

    async fn send_data(&self, opcode: OpCode, data: Bytes) -> Result<()> {
        if !opcode.is_data() {
            return Err(WebSocketError::InvalidMessageOpCode(opcode));
        }
        self.check_open()?;

        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) if !writer.is_closed() => Some(writer.send_message(opcode, data).await),
                _ => None,
            }
        };
        match sent {
            Some(result) => result,
            None => Err(WebSocketError::InvalidState(self.session().ready_state)),
        }
    }

    async fn send_control(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.send_frame(frame).await,
            None => Err(WebSocketError::ConnectionClosed),
        }
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        let (epoch, mut exited) = {
            let mut session = self.session();
            match session.ready_state {
                ReadyState::Connecting => {
                    let epoch = session.epoch;
                    drop(session);
                    self.discard_pending();
                    self.settle(epoch, CloseEvent::abnormal());
                    return Ok(());
                }
                ReadyState::Closing | ReadyState::Closed => return Ok(()),
                ReadyState::Open => {
                    session.ready_state = ReadyState::Closing;
                    (session.epoch, self.exit.subscribe())
                }
            }
        };
        self.release_ping();

        #[cfg(feature = "logging")]
        log::debug!("{} closing with {code}", self.role);

        let wait_time = self.options.wait_time;
        let sent = matches!(
            timeout(wait_time, self.send_control(Frame::close(code, reason))).await,
            Ok(Ok(()))
        );
        let exited = matches!(
            timeout(wait_time, exited.wait_for(|exited| *exited)).await,
            Ok(Ok(_))
        );

        let received = self.session().close_received.clone();
        let event = match received {
            Some((code, reason)) if sent && exited => CloseEvent {
                code,
                reason,
                was_clean: true,
            },
            _ => CloseEvent::abnormal(),
        };
        self.finish(epoch, event).await;
        Ok(())
    }

    /// Drops the transports of a session that never opened.
    fn discard_pending(&self) {
        lock(&self.pending).take();
        if let Some(dial) = self.dial.as_ref() {
            lock(&dial.io).take();
        }
    }

    /// Shuts the write half of session `epoch` down and settles it.
    async fn finish(&self, epoch: u64, event: CloseEvent) {
        let writer = match timeout(self.options.wait_time, self.writer.lock()).await {
            Ok(mut writer) if writer.as_ref().is_some_and(|writer| writer.epoch == epoch) => writer.take(),
            _ => None,
        };
        if let Some(mut writer) = writer {
            let _ = timeout(self.options.wait_time, writer.shutdown()).await;
        }
        self.settle(epoch, event);
    }

    /// Moves session `epoch` to `Closed` and queues its close event. Only the first call has an effect.
    fn settle(&self, epoch: u64, event: CloseEvent) -> bool {
        {
            let mut session = self.session();
            if session.epoch != epoch || session.ready_state == ReadyState::Closed {
                return false;
            }
            session.ready_state = ReadyState::Closed;
            if let Some(receiver) = session.receiver.take() {
                receiver.abort();
            }

            #[cfg(feature = "logging")]
            log::debug!(
                "{} closed: code={} clean={} reason={:?}",
                self.role,
                event.code,
                event.was_clean,
                event.reason
            );

            let _ = self.events_tx.send(Event::Close(event));
            self.exit.send_replace(true);
        }
        self.release_ping();
        true
    }

    // ================== Opening ====================

    async fn client_handshake(&self, dial: &Dial) -> Result<(BoxedTransport, BytesMut, Negotiation)> {
        let mut url = lock(&dial.url).clone();
        let mut provided = lock(&dial.io).take();

        loop {
            let mut io: BoxedTransport = match provided.take() {
                Some(io) => io,
                None => Box::new(
                    transport::dial(
                        &url,
                        dial.tcp_address,
                        dial.connector.as_ref(),
                        self.options.no_delay,
                    )
                    .await?,
                ),
            };

            let key = handshake::generate_key();
            let request = handshake::client_request(&url, &key, &self.options, &dial.headers)?;
            handshake::write_request(&mut io, &request).await?;

            let mut buffered = BytesMut::new();
            let response = handshake::read_response(&mut io, &mut buffered).await?;

            if let Some(target) = handshake::redirect_target(&response, &url) {
                let target = target?;
                if !self.options.follow_redirects {
                    return Err(WebSocketError::Redirect(target.to_string()));
                }
                {
                    let mut session = self.session();
                    if session.reconnects >= self.options.max_retries {
                        return Err(WebSocketError::RetryLimitExceeded);
                    }
                    session.reconnects += 1;
                }

                #[cfg(feature = "logging")]
                log::debug!("following redirect from {url} to {target}");

                *lock(&dial.url) = target.clone();
                url = target;
                continue;
            }

            let negotiation = handshake::verify_response(&response, &key, &self.options)?;
            return Ok((io, buffered, negotiation));
        }
    }

    async fn server_handshake(
        &self,
        io: &mut BoxedTransport,
        request: Option<HttpRequest>,
        buffered: &mut BytesMut,
    ) -> Result<Negotiation> {
        let request = match request {
            Some(request) => request,
            None => match timeout(
                self.options.handshake_timeout,
                handshake::read_request(io, buffered),
            )
            .await
            {
                Ok(request) => request?,
                Err(_) => return Err(WebSocketError::HandshakeTimeout),
            },
        };

        match handshake::negotiate(&request, &self.options) {
            Ok((response, negotiation)) => {
                handshake::write_response(io, &response).await?;
                Ok(negotiation)
            }
            Err(err) => {
                let _ = handshake::write_response(io, &handshake::rejection(&err)).await;
                Err(err)
            }
        }
    }

    async fn open(
        self: &Arc<Self>,
        epoch: u64,
        io: BoxedTransport,
        buffered: BytesMut,
        negotiation: Negotiation,
    ) -> Result<()> {
        let (reader, writer) = halves(self.role, &self.options, epoch, io, buffered, &negotiation);
        *self.writer.lock().await = Some(writer);
        if self.launch(epoch, reader, &negotiation) {
            return Ok(());
        }

        // closed while the handshake was running
        let mut writer = self.writer.lock().await;
        if writer.as_ref().is_some_and(|writer| writer.epoch == epoch) {
            writer.take();
        }
        Err(WebSocketError::ConnectionClosed)
    }

    /// Opens session `epoch` and starts its receive loop. Returns false when the session was closed
    /// during the handshake.
    fn launch(self: &Arc<Self>, epoch: u64, reader: Reader, negotiation: &Negotiation) -> bool {
        let mut session = self.session();
        if session.epoch != epoch || session.ready_state != ReadyState::Connecting {
            return false;
        }

        self.exit.send_replace(false);
        session.ready_state = ReadyState::Open;
        session.reconnects = 0;
        session.protocol = negotiation.protocol.clone();
        session.compression = negotiation.compression();
        let _ = self.events_tx.send(Event::Open);
        session.receiver = Some(self.spawn_receiver(epoch, reader));

        #[cfg(feature = "logging")]
        log::debug!(
            "{} open: protocol={:?} compression={:?}",
            self.role,
            session.protocol,
            session.compression
        );

        true
    }
}
