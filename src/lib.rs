//! # wsengine
//! Implementation of the WebSocket protocol (RFC 6455) and permessage-deflate compression (RFC 7692)
//! usable both as a client and as the per-connection engine of a server.
//!
//! Every connection is a cheap, cloneable [`WebSocket`] handle. A background task owns the read half of
//! the transport, answers pings, reassembles fragmented messages and drives the close handshake, while any
//! number of callers can send, ping or close concurrently. Inbound activity is delivered as an ordered
//! queue of [`Event`]s read with [`WebSocket::recv`].
//!
//! # Features
//! - `logging` (default): debug logging for negotiation, lifecycle and failures using the `log` crate.
//! - `simd`: validates UTF-8 text messages with `simdutf8`.
//!
//! # Client Example
//! ```no_run
//! use wsengine::{Event, WebSocket};
//!
//! async fn client() -> wsengine::Result<()> {
//!     let ws = WebSocket::client("ws://127.0.0.1:9001/echo".parse()?).await?;
//!     ws.send_text("hello").await?;
//!
//!     while let Some(event) = ws.recv().await {
//!         match event {
//!             Event::Message(message) => println!("received {}", message.text()),
//!             Event::Close(close) => println!("closed with {}", close.code),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Server Example
//! ```no_run
//! use std::sync::Arc;
//! use futures::{future::BoxFuture, FutureExt};
//! use tokio::net::TcpListener;
//! use wsengine::{handler::Handler, server::Server, Message, Options, WebSocket};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message<'a>(&'a self, ws: &'a WebSocket, message: Message) -> BoxFuture<'a, ()> {
//!         async move {
//!             let _ = ws.send_message(message).await;
//!         }
//!         .boxed()
//!     }
//! }
//!
//! async fn server() -> wsengine::Result<()> {
//!     let listener = TcpListener::bind("127.0.0.1:9001").await?;
//!     let server = Arc::new(Server::new(Options::default()).route("/echo", || Echo));
//!     server.run(listener).await
//! }
//! ```
//!
//! # Memory Safety
//! - Maximum frame payload and message sizes (configurable, 1 MiB and 2 MiB by default)
//! - Control frames are answered automatically and validated strictly
//! - UTF-8 validation for text messages (enabled by default)
//! - Decompression is bounded by the message size limit

#![cfg_attr(docsrs, feature(doc_cfg))]

mod compression;
mod fragment;
mod mask;
mod stream;
mod websocket;

pub mod close;
pub mod codec;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod payload;
pub mod server;
pub mod session;

use thiserror::Error;

pub use compression::{CompressionLevel, DeflateOptions};
pub use websocket::*;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The errors are broadly categorized into:
///
/// - Protocol errors, which fail the connection with a close code derived from the error
/// - Handshake errors, which prevent a connection from ever reaching [`ReadyState::Open`]
/// - Usage errors, returned by the API when an operation is not valid for the current state or arguments
/// - I/O and system-level errors
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Occurs when receiving a new data frame while a fragmented message is still being
    /// reassembled.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Indicates that a text message or close frame reason contains invalid UTF-8 data.
    /// According to RFC 6455, all text payloads must be valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Returned when receiving an HTTP status code that is not valid for a WebSocket handshake.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Indicates that the HTTP "Upgrade" header is either missing or does not contain
    /// the required "websocket" value during connection handshake.
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// Indicates that the HTTP "Connection" header is either missing or does not contain
    /// the required "upgrade" value during connection handshake.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// Returned when attempting to write on a connection whose close frame was already sent,
    /// or when the peer went away before an operation could complete.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Indicates that a received close frame has a payload of exactly 1 byte.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Occurs when a close code is not valid on the wire, or not allowed for the local role.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Returned by the close API when the reason does not fit in a control frame.
    #[error("Close reason is longer than 123 bytes")]
    InvalidCloseReason,

    /// Indicates that reserved bits in the WebSocket frame header are set when they
    /// should be 0.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Occurs when a control frame (ping, pong, or close) is received with the FIN bit
    /// not set. RFC 6455 requires that control frames must not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// Indicates that a control frame payload exceeds the maximum allowed size of 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// Occurs when a received frame's payload length exceeds the maximum configured size.
    #[error("Frame too large")]
    FrameTooLarge,

    /// Occurs when a reassembled (or decompressed) message exceeds the maximum configured size.
    #[error("Message too large")]
    MessageTooLarge,

    /// A server received a frame without a masking key.
    #[error("Received an unmasked frame from a client")]
    UnmaskedFrame,

    /// A client received a frame carrying a masking key.
    #[error("Received a masked frame from a server")]
    MaskedFrame,

    /// Returned when the "Sec-WebSocket-Version" header is not set to 13 during handshake.
    #[error("Sec-Websocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    /// Indicates receipt of a frame with a reserved opcode value.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Occurs during handshake when the required "Sec-WebSocket-Key" header is missing from
    /// the client request, or empty.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The "Sec-WebSocket-Accept" header of the server response does not match the key sent.
    #[error("Sec-WebSocket-Accept does not match the request key")]
    InvalidSecWebSocketAccept,

    /// The handshake request does not use the GET method.
    #[error("Handshake request method must be GET")]
    InvalidMethod,

    /// The handshake was not carried over HTTP/1.1.
    #[error("Handshake must use HTTP/1.1")]
    InvalidHttpVersion,

    /// A handshake header is present but empty or malformed.
    #[error("Invalid {0} header")]
    InvalidHeader(&'static str),

    /// A sub-protocol is not a valid token, is duplicated, or was not requested by the client.
    #[error("Invalid sub-protocol: {0}")]
    InvalidProtocol(String),

    /// The negotiated extensions are not acceptable.
    #[error("Invalid extension: {0}")]
    InvalidExtension(String),

    /// The HTTP head of the handshake is larger than the allowed ceiling.
    #[error("Handshake head is too large")]
    HeaderTooLarge,

    /// The handshake did not complete within the configured timeout.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// The server answered the handshake with a redirect that was not followed.
    #[error("Redirected to {0}")]
    Redirect(String),

    /// Returned when attempting to establish a WebSocket connection with an invalid URL scheme.
    /// Only "ws://" and "wss://" schemes are valid.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// Occurs when receiving a compressed frame on a connection where compression was not
    /// negotiated during the handshake.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// A compressed message could not be inflated.
    #[error("Invalid compressed data")]
    InvalidCompressedData,

    /// The operation is not allowed in the current ready state.
    #[error("Operation not allowed while {0}")]
    InvalidState(ReadyState),

    /// The client exceeded `Options::max_retries` consecutive reconnect attempts.
    #[error("Reconnect limit exceeded")]
    RetryLimitExceeded,

    /// Returned when sending a message whose opcode is not `Text` or `Binary`.
    #[error("Cannot send a {0:?} message")]
    InvalidMessageOpCode(frame::OpCode),

    /// Returned by `send_reader` when nothing could be read from the source.
    #[error("No data could be read from the source")]
    NoData,

    /// An internal failure, such as a panic in the receive loop or in a handler.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wraps errors from URL parsing that may occur when processing WebSocket URLs.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps errors from raw HTTP head parsing.
    #[error(transparent)]
    HttpParseError(#[from] httparse::Error),

    /// Wraps errors raised while building HTTP requests and responses.
    #[error(transparent)]
    HttpError(#[from] http::Error),

    /// Wraps standard I/O errors that may occur during WebSocket communication.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Wraps errors from the hyper HTTP library used by the upgrade adapter.
    #[error(transparent)]
    HyperError(#[from] hyper::Error),
}

impl WebSocketError {
    /// Returns true for errors raised because the peer violated the protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFragment
                | Self::InvalidContinuationFrame
                | Self::InvalidCloseFrame
                | Self::InvalidCloseCode(_)
                | Self::ReservedBitsNotZero
                | Self::ControlFrameFragmented
                | Self::ControlFrameTooLarge
                | Self::UnmaskedFrame
                | Self::MaskedFrame
                | Self::InvalidOpCode(_)
                | Self::CompressionNotSupported
                | Self::InvalidCompressedData
        )
    }
}
