//! permessage-deflate (RFC 7692): extension negotiation and the raw deflate streams.
use std::{fmt, io};

use bytes::Bytes;
use flate2::{FlushCompress, FlushDecompress, Status};
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space0},
    combinator::opt,
    sequence::{pair, preceded},
    IResult, Parser,
};

use crate::{Result, Role, WebSocketError};

/// Compression level of the deflate stream.
pub type CompressionLevel = flate2::Compression;

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Every sync-flushed deflate block ends with an empty stored block, which RFC 7692 strips from the wire.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// The largest LZ77 window, the only one available without zlib.
const MAX_WINDOW_BITS: u8 = 15;

/// Compression negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    /// Messages travel uncompressed.
    #[default]
    None,
    /// permessage-deflate was negotiated.
    Deflate,
}

/// Configuration of the permessage-deflate extension.
///
/// ```rust
/// use wsengine::{CompressionLevel, DeflateOptions};
///
/// let options = DeflateOptions {
///     level: CompressionLevel::fast(),
///     ..Default::default()
/// };
/// assert!(options.server_no_context_takeover);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DeflateOptions {
    /// Sets the compression level (0-9), balancing compression ratio against CPU usage.
    pub level: CompressionLevel,

    /// When `true`, the server resets its compression context after each message.
    pub server_no_context_takeover: bool,

    /// When `true`, the client resets its compression context after each message.
    pub client_no_context_takeover: bool,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            level: CompressionLevel::default(),
            server_no_context_takeover: true,
            client_no_context_takeover: true,
        }
    }
}

impl DeflateOptions {
    /// Combines a client offer with the local configuration; either side may ask for a context reset.
    pub(crate) fn merge(&self, offered: &WebSocketExtensions) -> WebSocketExtensions {
        WebSocketExtensions {
            server_no_context_takeover: offered.server_no_context_takeover
                || self.server_no_context_takeover,
            client_no_context_takeover: offered.client_no_context_takeover
                || self.client_no_context_takeover,
            server_max_window_bits: None,
            client_max_window_bits: None,
        }
    }

    /// Server side: picks the first acceptable permessage-deflate offer of a
    /// `Sec-WebSocket-Extensions` header, if any.
    ///
    /// Offers that limit the server window below 15 bits cannot be honoured and are declined.
    pub(crate) fn accept(&self, header: &str) -> Option<WebSocketExtensions> {
        header
            .split(',')
            .filter_map(|offer| offer.trim().parse::<WebSocketExtensions>().ok())
            .find(|offer| {
                let acceptable = offer
                    .server_max_window_bits
                    .map_or(true, |bits| bits == MAX_WINDOW_BITS);
                #[cfg(feature = "logging")]
                if !acceptable {
                    log::debug!("declining permessage-deflate offer {offer}");
                }
                acceptable
            })
            .map(|offer| self.merge(&offer))
    }

    /// Client side: validates the extensions selected by the server against what was offered.
    pub(crate) fn verify(&self, header: &str) -> Result<WebSocketExtensions> {
        if header.contains(',') {
            return Err(WebSocketError::InvalidExtension(header.to_owned()));
        }

        let selected: WebSocketExtensions = header
            .trim()
            .parse()
            .map_err(|_| WebSocketError::InvalidExtension(header.to_owned()))?;

        if selected
            .client_max_window_bits
            .is_some_and(|bits| bits != MAX_WINDOW_BITS)
        {
            return Err(WebSocketError::InvalidExtension(
                "client_max_window_bits was not offered".to_owned(),
            ));
        }

        if self.server_no_context_takeover && !selected.server_no_context_takeover {
            return Err(WebSocketError::InvalidExtension(
                "server_no_context_takeover was not acknowledged".to_owned(),
            ));
        }

        #[cfg(feature = "logging")]
        if self.client_no_context_takeover && !selected.client_no_context_takeover {
            log::warn!("server did not acknowledge client_no_context_takeover");
        }

        Ok(WebSocketExtensions {
            client_no_context_takeover: selected.client_no_context_takeover
                || self.client_no_context_takeover,
            ..selected
        })
    }
}

/// Parameters of a permessage-deflate offer or response, as carried by `Sec-WebSocket-Extensions`.
///
/// Window bits given without a value parse as `Some(0)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebSocketExtensions {
    pub(crate) server_max_window_bits: Option<u8>,
    pub(crate) client_max_window_bits: Option<u8>,
    pub(crate) server_no_context_takeover: bool,
    pub(crate) client_no_context_takeover: bool,
}

impl From<&DeflateOptions> for WebSocketExtensions {
    fn from(value: &DeflateOptions) -> Self {
        Self {
            server_max_window_bits: None,
            client_max_window_bits: None,
            server_no_context_takeover: value.server_no_context_takeover,
            client_no_context_takeover: value.client_no_context_takeover,
        }
    }
}

impl fmt::Display for WebSocketExtensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PERMESSAGE_DEFLATE}")?;

        for (name, bits) in [
            ("server_max_window_bits", self.server_max_window_bits),
            ("client_max_window_bits", self.client_max_window_bits),
        ] {
            match bits {
                Some(bits) if (8..16).contains(&bits) => write!(f, "; {name}={bits}")?,
                Some(_) => write!(f, "; {name}")?,
                None => {}
            }
        }
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }

        Ok(())
    }
}

impl WebSocketExtensions {
    fn parse(input: &str) -> std::result::Result<Self, nom::Err<nom::error::Error<&str>>> {
        let mut this = Self::default();
        let (mut input, _) = tag(PERMESSAGE_DEFLATE).parse(input)?;

        while !input.trim_end().is_empty() {
            let (remaining, (key, value)) = Self::parse_param(input)?;
            let bits = || value.map_or(Some(0), |value| value.parse().ok());
            match key {
                "client_no_context_takeover" => this.client_no_context_takeover = true,
                "server_no_context_takeover" => this.server_no_context_takeover = true,
                "server_max_window_bits" => this.server_max_window_bits = bits(),
                "client_max_window_bits" => this.client_max_window_bits = bits(),
                _ => {}
            }
            input = remaining;
        }

        Ok(this)
    }

    /// `; key` or `; key=digits`
    fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
        preceded(
            (space0, tag(";"), space0),
            pair(
                take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                opt(preceded((space0, tag("="), space0), digit1)),
            ),
        )
        .parse(input)
    }
}

impl std::str::FromStr for WebSocketExtensions {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(input).map_err(|err| err.to_string())
    }
}

/// Compresses whole messages into a raw deflate stream.
pub(crate) struct Compressor {
    compress: flate2::Compress,
    no_context_takeover: bool,
}

impl Compressor {
    pub fn new(level: CompressionLevel, no_context_takeover: bool) -> Self {
        Self {
            compress: flate2::Compress::new(level, false),
            no_context_takeover,
        }
    }

    /// Compresses one message and strips the trailing empty block.
    pub fn compress(&mut self, input: &[u8]) -> io::Result<Bytes> {
        if self.no_context_takeover {
            self.compress.reset();
        }

        let mut output = Vec::with_capacity(input.len() / 2 + 64);
        let mut input = input;
        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(1024));
            }

            let before = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut output, FlushCompress::Sync)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
            let consumed = (self.compress.total_in() - before) as usize;
            input = &input[consumed..];

            // the flush is complete once deflate stops short of filling the buffer
            if input.is_empty() && output.len() < output.capacity() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }

        Ok(output.into())
    }
}

/// Inflates whole messages produced by a peer [`Compressor`].
pub(crate) struct Decompressor {
    decompress: flate2::Decompress,
    no_context_takeover: bool,
}

impl Decompressor {
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            decompress: flate2::Decompress::new(false),
            no_context_takeover,
        }
    }

    /// Inflates one message, failing with `MessageTooLarge` as soon as the output exceeds `max_size`.
    pub fn decompress(&mut self, input: &[u8], max_size: usize) -> Result<Bytes> {
        if self.no_context_takeover {
            self.decompress.reset(false);
        }

        let mut output = Vec::with_capacity((input.len() * 2).clamp(64, max_size.max(64)));
        'chunks: for chunk in [input, &DEFLATE_TRAILER[..]] {
            let mut chunk = chunk;
            loop {
                if output.len() == output.capacity() {
                    output.reserve(output.capacity().max(1024));
                }

                let before_in = self.decompress.total_in();
                let before_out = self.decompress.total_out();
                let status = self
                    .decompress
                    .decompress_vec(chunk, &mut output, FlushDecompress::Sync)
                    .map_err(|_| WebSocketError::InvalidCompressedData)?;
                let consumed = (self.decompress.total_in() - before_in) as usize;
                let produced = self.decompress.total_out() - before_out;
                chunk = &chunk[consumed..];

                if output.len() > max_size {
                    return Err(WebSocketError::MessageTooLarge);
                }

                match status {
                    // a final block ends the stream, the next message starts a new one
                    Status::StreamEnd => {
                        self.decompress.reset(false);
                        break 'chunks;
                    }
                    _ if chunk.is_empty() && output.len() < output.capacity() => break,
                    _ if consumed == 0 && produced == 0 && output.len() < output.capacity() => {
                        return Err(WebSocketError::InvalidCompressedData);
                    }
                    _ => {}
                }
            }
        }

        Ok(output.into())
    }
}

/// Builds the compressor and decompressor pair of an endpoint playing `role`.
pub(crate) fn deflate_pair(
    extensions: &WebSocketExtensions,
    level: CompressionLevel,
    role: Role,
) -> (Compressor, Decompressor) {
    let (local_reset, remote_reset) = match role {
        Role::Server => (
            extensions.server_no_context_takeover,
            extensions.client_no_context_takeover,
        ),
        Role::Client => (
            extensions.client_no_context_takeover,
            extensions.server_no_context_takeover,
        ),
    };

    #[cfg(feature = "logging")]
    log::debug!(
        "{role} deflate: compressor no_context_takeover={local_reset}, decompressor no_context_takeover={remote_reset}"
    );

    (
        Compressor::new(level, local_reset),
        Decompressor::new(remote_reset),
    )
}
