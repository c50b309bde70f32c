use std::time::Duration;

use crate::compression::{CompressionLevel, DeflateOptions};

/// The default maximum payload size for a single frame: 1 MiB.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The default maximum size of a reassembled message: 2 MiB.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// The default size of the frames outgoing messages are split into.
pub const FRAGMENT_SIZE: usize = 1016;

/// How long pings wait for their pong and closes wait for the peer's close frame.
pub const WAIT_TIME: Duration = Duration::from_secs(1);

/// How long the HTTP head of the handshake may take to arrive.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(90);

/// How many consecutive reconnects a client may attempt.
pub const MAX_RETRIES: usize = 10;

/// Configuration options for a WebSocket connection.
///
/// Built with the `with_*` methods on top of [`Options::default`]:
///
/// ```rust
/// use std::time::Duration;
/// use wsengine::{CompressionLevel, Options};
///
/// let options = Options::default()
///     .with_compression_level(CompressionLevel::fast())
///     .with_max_payload_read(64 * 1024)
///     .with_wait_time(Duration::from_secs(5))
///     .with_protocols(["chat"]);
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum allowed payload size of a single incoming frame, in bytes.
    ///
    /// Larger frames fail the connection with 1009 before their payload is read.
    ///
    /// Default: 1 MiB as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: Option<usize>,

    /// Maximum size of a reassembled (and decompressed) message, in bytes.
    ///
    /// Default: 2 MiB as defined in [`MAX_MESSAGE_SIZE`], or twice the configured
    /// `max_payload_read` when only that is set.
    pub max_message_size: Option<usize>,

    /// permessage-deflate settings. `None` disables compression.
    ///
    /// Default: `None`
    pub compression: Option<DeflateOptions>,

    /// Whether incoming text messages are validated as UTF-8, failing the connection with 1007.
    ///
    /// Default: `true`
    pub check_utf8: bool,

    /// Size of the frames outgoing messages are split into.
    ///
    /// Default: 1016 bytes as defined in [`FRAGMENT_SIZE`]
    pub fragment_size: usize,

    /// Upper bound for a ping to be answered and for the peer to echo a close frame.
    ///
    /// Default: 1 second
    pub wait_time: Duration,

    /// Upper bound for reading the HTTP head of the handshake.
    ///
    /// Default: 90 seconds
    pub handshake_timeout: Duration,

    /// Consecutive reconnects a client may attempt before `connect` fails with
    /// [`RetryLimitExceeded`](crate::WebSocketError::RetryLimitExceeded). Followed redirects count too.
    ///
    /// Default: 10
    pub max_retries: usize,

    /// Whether a client follows `3xx` responses to the handshake.
    ///
    /// Default: `false`
    pub follow_redirects: bool,

    /// Sub-protocols, in order of preference. A client offers them all; a server selects the first
    /// protocol requested by the client that appears in this list.
    pub protocols: Vec<String>,

    /// Value of the `Origin` header sent by a client.
    pub origin: Option<String>,

    /// Whether inbound pings are reported as [`Event::Ping`](crate::Event::Ping). They are answered
    /// either way.
    ///
    /// Default: `false`
    pub emit_on_ping: bool,

    /// Sets `TCP_NODELAY` on sockets dialed by a client.
    ///
    /// Default: `true`
    pub no_delay: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: None,
            max_message_size: None,
            compression: None,
            check_utf8: true,
            fragment_size: FRAGMENT_SIZE,
            wait_time: WAIT_TIME,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            max_retries: MAX_RETRIES,
            follow_redirects: false,
            protocols: Vec::new(),
            origin: None,
            emit_on_ping: false,
            no_delay: true,
        }
    }
}

impl Options {
    pub(crate) fn payload_limit(&self) -> usize {
        self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ)
    }

    pub(crate) fn message_limit(&self) -> usize {
        self.max_message_size.unwrap_or(
            self.max_payload_read
                .map(|payload_read| payload_read.saturating_mul(2))
                .unwrap_or(MAX_MESSAGE_SIZE),
        )
    }

    /// Enables permessage-deflate with the given settings.
    pub fn with_compression(self, compression: DeflateOptions) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Enables permessage-deflate, using `level` for outgoing messages.
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.level = level;

        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables compression for the WebSocket connection.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Asks the server to reset its compression context after each message.
    pub fn server_no_context_takeover(self, enabled: bool) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_no_context_takeover = enabled;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Asks the client to reset its compression context after each message.
    pub fn client_no_context_takeover(self, enabled: bool) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_no_context_takeover = enabled;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sets the maximum allowed payload size of incoming frames.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of reassembled messages.
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: Some(size),
            ..self
        }
    }

    /// Enables UTF-8 validation for incoming text messages.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Disables UTF-8 validation; invalid text is delivered and reads as an empty string.
    pub fn without_utf8(self) -> Self {
        Self {
            check_utf8: false,
            ..self
        }
    }

    /// Sets the size outgoing messages are fragmented at. Zero is treated as one.
    pub fn with_fragment_size(self, size: usize) -> Self {
        Self {
            fragment_size: size.max(1),
            ..self
        }
    }

    pub fn with_wait_time(self, wait_time: Duration) -> Self {
        Self { wait_time, ..self }
    }

    pub fn with_handshake_timeout(self, handshake_timeout: Duration) -> Self {
        Self {
            handshake_timeout,
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: usize) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Makes a client follow `3xx` handshake responses.
    pub fn with_redirects(self) -> Self {
        Self {
            follow_redirects: true,
            ..self
        }
    }

    /// Sets the sub-protocols, in order of preference.
    pub fn with_protocols<I, S>(self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_origin(self, origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..self
        }
    }

    /// Reports inbound pings as events.
    pub fn with_ping_events(self) -> Self {
        Self {
            emit_on_ping: true,
            ..self
        }
    }

    pub fn with_no_delay(self, no_delay: bool) -> Self {
        Self { no_delay, ..self }
    }
}
