//! The HTTP/1.1 Upgrade handshake (RFC 6455 section 4).
//!
//! Requests and responses are plain [`http`] types with an empty body. The heads are read from and
//! written to the transport directly; bytes that follow a head stay in the read buffer and are handed to
//! the frame decoder.
use std::io;

use base64::prelude::*;
use bytes::{Buf, BytesMut};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Version};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::{
    compression::{deflate_pair, CompressionLevel, CompressionMethod, Compressor, Decompressor, WebSocketExtensions},
    Options, Result, Role, WebSocketError,
};

/// A handshake request.
pub type HttpRequest = http::Request<()>;

/// A handshake response.
pub type HttpResponse = http::Response<()>;

/// Largest HTTP head accepted during the handshake.
pub const MAX_HEADER_SIZE: usize = 8192;

const MAX_HEADERS: usize = 64;

const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
///
/// ```rust
/// assert_eq!(
///     wsengine::handshake::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// What both endpoints agreed on during the handshake.
#[derive(Debug, Clone, Default)]
pub(crate) struct Negotiation {
    pub protocol: Option<String>,
    pub extensions: Option<WebSocketExtensions>,
    pub compression_level: CompressionLevel,
}

impl Negotiation {
    pub fn compression(&self) -> CompressionMethod {
        match self.extensions {
            Some(_) => CompressionMethod::Deflate,
            None => CompressionMethod::None,
        }
    }

    pub fn deflate(&self, role: Role) -> Option<(Compressor, Decompressor)> {
        self.extensions
            .as_ref()
            .map(|extensions| deflate_pair(extensions, self.compression_level, role))
    }
}

// ================== Client ====================

/// Builds the upgrade request for `url`. `headers` are added first and may be overridden by the
/// handshake headers, except `Host`.
pub(crate) fn client_request(
    url: &Url,
    key: &str,
    options: &Options,
    headers: &HeaderMap,
) -> Result<HttpRequest> {
    let host = url.host_str().ok_or(WebSocketError::InvalidHttpScheme)?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };

    let mut request = HttpRequest::new(());
    *request.method_mut() = Method::GET;
    *request.uri_mut() = url[url::Position::BeforePath..url::Position::AfterQuery]
        .parse::<http::Uri>()
        .map_err(http::Error::from)?;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers.clone();

    let headers = request.headers_mut();
    if !headers.contains_key(header::HOST) {
        headers.insert(header::HOST, header_value(&host)?);
    }
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::SEC_WEBSOCKET_KEY, header_value(key)?);
    headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));

    if !options.protocols.is_empty() {
        validate_protocols(&options.protocols)?;
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            header_value(&options.protocols.join(", "))?,
        );
    }

    if let Some(compression) = options.compression.as_ref() {
        let extensions = WebSocketExtensions::from(compression);
        headers.insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            header_value(&extensions.to_string())?,
        );
    }

    if let Some(origin) = options.origin.as_deref() {
        headers.insert(header::ORIGIN, header_value(origin)?);
    }

    Ok(request)
}

/// Returns the target of a redirect response, mapped to a WebSocket scheme.
pub(crate) fn redirect_target(response: &HttpResponse, current: &Url) -> Option<Result<Url>> {
    if !response.status().is_redirection() {
        return None;
    }

    let location = response.headers().get(header::LOCATION)?;
    Some(redirect_url(location, current))
}

fn redirect_url(location: &HeaderValue, current: &Url) -> Result<Url> {
    let location = location
        .to_str()
        .map_err(|_| WebSocketError::InvalidHeader("Location"))?;
    let mut url = current.join(location)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return Err(WebSocketError::InvalidHttpScheme),
    };
    url.set_scheme(scheme)
        .map_err(|_| WebSocketError::InvalidHttpScheme)?;
    Ok(url)
}

/// Validates the server response to a request sent with `key`.
pub(crate) fn verify_response(response: &HttpResponse, key: &str, options: &Options) -> Result<Negotiation> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(WebSocketError::InvalidStatusCode(response.status().as_u16()));
    }

    let headers = response.headers();

    if !contains_token(headers, header::UPGRADE, "websocket") {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !contains_token(headers, header::CONNECTION, "upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    if headers.get(header::SEC_WEBSOCKET_ACCEPT).map(HeaderValue::as_bytes)
        != Some(accept_key(key).as_bytes())
    {
        return Err(WebSocketError::InvalidSecWebSocketAccept);
    }

    if let Some(version) = headers.get(header::SEC_WEBSOCKET_VERSION) {
        if version.as_bytes() != b"13" {
            return Err(WebSocketError::InvalidSecWebsocketVersion);
        }
    }

    let protocol = match joined(headers, header::SEC_WEBSOCKET_PROTOCOL)? {
        Some(protocol) if options.protocols.iter().any(|p| *p == protocol) => Some(protocol),
        Some(protocol) => return Err(WebSocketError::InvalidProtocol(protocol)),
        None => None,
    };

    let extensions = match joined(headers, header::SEC_WEBSOCKET_EXTENSIONS)? {
        Some(selected) => match options.compression.as_ref() {
            Some(compression) => Some(compression.verify(&selected)?),
            None => return Err(WebSocketError::InvalidExtension(selected)),
        },
        None => None,
    };

    #[cfg(feature = "logging")]
    log::debug!(
        "client negotiated protocol={protocol:?} extensions={:?}",
        extensions.as_ref().map(ToString::to_string)
    );

    Ok(Negotiation {
        protocol,
        extensions,
        compression_level: compression_level(options),
    })
}

// ================== Server ====================

/// Validates an upgrade request and builds the `101 Switching Protocols` response.
///
/// On error, [`rejection`] gives the response to send back.
pub(crate) fn negotiate(request: &HttpRequest, options: &Options) -> Result<(HttpResponse, Negotiation)> {
    if request.method() != Method::GET {
        return Err(WebSocketError::InvalidMethod);
    }

    if request.version() != Version::HTTP_11 {
        return Err(WebSocketError::InvalidHttpVersion);
    }

    let headers = request.headers();

    if !contains_token(headers, header::UPGRADE, "websocket") {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !contains_token(headers, header::CONNECTION, "upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|key| key.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(WebSocketError::MissingSecWebSocketKey)?;

    if headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|v| v.as_bytes())
        != Some(b"13")
    {
        return Err(WebSocketError::InvalidSecWebsocketVersion);
    }

    let protocol = joined(headers, header::SEC_WEBSOCKET_PROTOCOL)?.and_then(|requested| {
        requested
            .split(',')
            .map(str::trim)
            .find(|requested| options.protocols.iter().any(|p| p == requested))
            .map(str::to_owned)
    });

    let extensions = joined(headers, header::SEC_WEBSOCKET_EXTENSIONS)?.and_then(|offered| {
        options
            .compression
            .as_ref()
            .and_then(|compression| compression.accept(&offered))
    });

    let mut response = HttpResponse::new(());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let response_headers = response.headers_mut();
    response_headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    response_headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    response_headers.insert(header::SEC_WEBSOCKET_ACCEPT, header_value(&accept_key(key))?);
    if let Some(protocol) = protocol.as_deref() {
        response_headers.insert(header::SEC_WEBSOCKET_PROTOCOL, header_value(protocol)?);
    }
    if let Some(extensions) = extensions.as_ref() {
        response_headers.insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            header_value(&extensions.to_string())?,
        );
    }

    #[cfg(feature = "logging")]
    log::debug!(
        "server negotiated protocol={protocol:?} extensions={:?}",
        extensions.as_ref().map(ToString::to_string)
    );

    Ok((
        response,
        Negotiation {
            protocol,
            extensions,
            compression_level: compression_level(options),
        },
    ))
}

/// The response refusing a handshake that failed with `err`.
pub(crate) fn rejection(err: &WebSocketError) -> HttpResponse {
    let mut response = HttpResponse::new(());
    match err {
        WebSocketError::InvalidSecWebsocketVersion => {
            *response.status_mut() = StatusCode::UPGRADE_REQUIRED;
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        }
        _ => *response.status_mut() = StatusCode::BAD_REQUEST,
    }
    response
}

/// A bare response with `status`, such as `404 Not Found` for unknown routes.
pub(crate) fn status_response(status: StatusCode) -> HttpResponse {
    let mut response = HttpResponse::new(());
    *response.status_mut() = status;
    response
}

fn compression_level(options: &Options) -> CompressionLevel {
    options
        .compression
        .as_ref()
        .map(|compression| compression.level)
        .unwrap_or_default()
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| WebSocketError::HttpError(err.into()))
}

/// Whether the comma separated header `name` contains `token`, ignoring case.
fn contains_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

/// All the values of `name` joined with `, `. Present but empty values are an error.
fn joined(headers: &HeaderMap, name: header::HeaderName) -> Result<Option<String>> {
    let values = headers
        .get_all(&name)
        .iter()
        .map(|value| value.to_str().map(str::trim))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| WebSocketError::InvalidHeader(header_label(&name)))?;

    if values.is_empty() {
        return Ok(None);
    }
    if values.iter().any(|value| value.is_empty()) {
        return Err(WebSocketError::InvalidHeader(header_label(&name)));
    }
    Ok(Some(values.join(", ")))
}

fn header_label(name: &header::HeaderName) -> &'static str {
    if *name == header::SEC_WEBSOCKET_PROTOCOL {
        "Sec-WebSocket-Protocol"
    } else if *name == header::SEC_WEBSOCKET_EXTENSIONS {
        "Sec-WebSocket-Extensions"
    } else {
        "handshake"
    }
}

/// Sub-protocols must be distinct HTTP tokens.
fn validate_protocols(protocols: &[String]) -> Result<()> {
    for (i, protocol) in protocols.iter().enumerate() {
        let is_token = !protocol.is_empty()
            && protocol
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
        if !is_token || protocols[..i].contains(protocol) {
            return Err(WebSocketError::InvalidProtocol(protocol.clone()));
        }
    }
    Ok(())
}

// ================== Wire ====================

/// Reads a request head from `io`. Bytes past the head remain in `buf`.
pub(crate) async fn read_request<S>(io: &mut S, buf: &mut BytesMut) -> Result<HttpRequest>
where
    S: AsyncRead + Unpin,
{
    loop {
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut head = httparse::Request::new(&mut headers);
            match head.parse(&buf[..])? {
                httparse::Status::Complete(len) => Some((build_request(&head)?, len)),
                httparse::Status::Partial => None,
            }
        };

        if let Some((request, len)) = parsed {
            buf.advance(len);
            return Ok(request);
        }

        fill(io, buf).await?;
    }
}

/// Reads a response head from `io`. Bytes past the head remain in `buf`.
pub(crate) async fn read_response<S>(io: &mut S, buf: &mut BytesMut) -> Result<HttpResponse>
where
    S: AsyncRead + Unpin,
{
    loop {
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut head = httparse::Response::new(&mut headers);
            match head.parse(&buf[..])? {
                httparse::Status::Complete(len) => Some((build_response(&head)?, len)),
                httparse::Status::Partial => None,
            }
        };

        if let Some((response, len)) = parsed {
            buf.advance(len);
            return Ok(response);
        }

        fill(io, buf).await?;
    }
}

async fn fill<S>(io: &mut S, buf: &mut BytesMut) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    if buf.len() >= MAX_HEADER_SIZE {
        return Err(WebSocketError::HeaderTooLarge);
    }

    buf.reserve(1024);
    if io.read_buf(buf).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed during the handshake",
        )
        .into());
    }
    Ok(())
}

fn build_request(head: &httparse::Request<'_, '_>) -> Result<HttpRequest> {
    let mut builder = http::Request::builder()
        .method(head.method.unwrap_or_default())
        .uri(head.path.unwrap_or("/"))
        .version(http_version(head.version));
    for h in head.headers.iter() {
        builder = builder.header(h.name, h.value);
    }
    Ok(builder.body(())?)
}

fn build_response(head: &httparse::Response<'_, '_>) -> Result<HttpResponse> {
    let mut builder = http::Response::builder()
        .status(head.code.unwrap_or_default())
        .version(http_version(head.version));
    for h in head.headers.iter() {
        builder = builder.header(h.name, h.value);
    }
    Ok(builder.body(())?)
}

fn http_version(minor: Option<u8>) -> Version {
    match minor {
        Some(1) => Version::HTTP_11,
        _ => Version::HTTP_10,
    }
}

/// Writes a request head.
pub(crate) async fn write_request<S>(io: &mut S, request: &HttpRequest) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut head = BytesMut::with_capacity(256);
    head.extend_from_slice(request.method().as_str().as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(request.uri().to_string().as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    write_head(io, head, request.headers()).await
}

/// Writes a response head.
pub(crate) async fn write_response<S>(io: &mut S, response: &HttpResponse) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let status = response.status();
    let mut head = BytesMut::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(status.as_str().as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    head.extend_from_slice(b"\r\n");

    let mut headers = response.headers().clone();
    if !status.is_informational() && !headers.contains_key(header::CONTENT_LENGTH) {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    }
    write_head(io, head, &headers).await
}

async fn write_head<S>(io: &mut S, mut head: BytesMut, headers: &HeaderMap) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    io.write_all(&head).await?;
    io.flush().await?;
    Ok(())
}
