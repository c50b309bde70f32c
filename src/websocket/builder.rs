use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{future::BoxFuture, FutureExt};
use http::HeaderMap;
use tokio_rustls::TlsConnector;
use url::Url;

use super::{Dial, WebSocket};
use crate::{stream::Transport, Options, Result, WebSocketError};

/// Builder for client connections.
///
/// [`build`](WebSocketBuilder::build) returns a socket in
/// [`ReadyState::Connecting`](crate::ReadyState::Connecting) to be opened later with
/// [`WebSocket::connect`]. Awaiting the builder does both and resolves once the socket is open.
///
/// # Example
/// ```no_run
/// use wsengine::{Options, WebSocket};
///
/// async fn connect_example() -> wsengine::Result<()> {
///     let ws = WebSocket::client("wss://example.com/socket".parse()?)
///         .with_options(Options::default().with_protocols(["chat"]))
///         .with_request(http::Request::builder().header("Authorization", "Bearer token"))
///         .await?;
///
///     ws.send_text("hello").await?;
///     Ok(())
/// }
/// ```
pub struct WebSocketBuilder {
    opts: Option<BuilderOpts>,
    future: Option<BoxFuture<'static, Result<WebSocket>>>,
}

struct BuilderOpts {
    url: Url,
    options: Option<Options>,
    connector: Option<TlsConnector>,
    tcp_address: Option<SocketAddr>,
    request: Option<http::request::Builder>,
    io: Option<Box<dyn Transport>>,
}

impl WebSocketBuilder {
    pub(crate) fn new(url: Url) -> Self {
        Self {
            opts: Some(BuilderOpts {
                url,
                options: None,
                connector: None,
                tcp_address: None,
                request: None,
                io: None,
            }),
            future: None,
        }
    }

    fn opts(&mut self) -> Option<&mut BuilderOpts> {
        self.opts.as_mut()
    }

    /// Sets the connection options.
    pub fn with_options(mut self, options: Options) -> Self {
        if let Some(opts) = self.opts() {
            opts.options = Some(options);
        }
        self
    }

    /// Sets the TLS connector used for `wss://` URLs, for custom roots or client certificates.
    pub fn with_connector(mut self, connector: TlsConnector) -> Self {
        if let Some(opts) = self.opts() {
            opts.connector = Some(connector);
        }
        self
    }

    /// Connects to `address` instead of resolving the host of the URL.
    pub fn with_tcp_address(mut self, address: SocketAddr) -> Self {
        if let Some(opts) = self.opts() {
            opts.tcp_address = Some(address);
        }
        self
    }

    /// Adds the headers of `builder` to the upgrade request. Handshake headers always take precedence,
    /// except `Host`.
    pub fn with_request(mut self, builder: http::request::Builder) -> Self {
        if let Some(opts) = self.opts() {
            opts.request = Some(builder);
        }
        self
    }

    /// Runs the first handshake over an already established transport instead of dialing.
    /// Reconnects dial the URL.
    pub fn with_io(mut self, io: impl Transport) -> Self {
        if let Some(opts) = self.opts() {
            opts.io = Some(Box::new(io));
        }
        self
    }

    /// Creates the socket without connecting it.
    pub fn build(mut self) -> Result<WebSocket> {
        let opts = self
            .opts
            .take()
            .ok_or_else(|| WebSocketError::Internal("builder already consumed".into()))?;
        opts.build()
    }
}

impl BuilderOpts {
    fn build(self) -> Result<WebSocket> {
        if !matches!(self.url.scheme(), "ws" | "wss") {
            return Err(WebSocketError::InvalidHttpScheme);
        }

        let headers = match self.request {
            Some(builder) => builder.body(())?.into_parts().0.headers,
            None => HeaderMap::new(),
        };

        let dial = Dial::new(self.url, headers, self.connector, self.tcp_address, self.io);
        Ok(WebSocket::with_dial(self.options.unwrap_or_default(), dial))
    }
}

impl Future for WebSocketBuilder {
    type Output = Result<WebSocket>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(opts) = this.opts.take() {
            this.future = Some(Box::pin(async move {
                let ws = opts.build()?;
                ws.connect().await?;
                Ok(ws)
            }));
        }

        match this.future.as_mut() {
            Some(future) => future.poll_unpin(cx),
            None => Poll::Ready(Err(WebSocketError::Internal(
                "builder polled after completion".into(),
            ))),
        }
    }
}
