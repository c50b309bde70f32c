//! Transports the engine runs on.
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{
    client::TlsStream,
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};
use url::Url;

use crate::{Result, WebSocketError};

/// Any established, bidirectional byte stream a connection can run on.
///
/// Implemented for every `AsyncRead + AsyncWrite` type that can be moved to a task.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) type BoxedTransport = Box<dyn Transport>;

/// A TCP stream, optionally wrapped in TLS for `wss://` URLs.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens a TCP connection to `url`, or to `tcp_address` when given, and wraps it in TLS for `wss://`.
pub(crate) async fn dial(
    url: &Url,
    tcp_address: Option<SocketAddr>,
    connector: Option<&TlsConnector>,
    no_delay: bool,
) -> Result<MaybeTlsStream> {
    let host = url.host_str().ok_or(WebSocketError::InvalidHttpScheme)?;
    let tls = match url.scheme() {
        "ws" => false,
        "wss" => true,
        _ => return Err(WebSocketError::InvalidHttpScheme),
    };

    let tcp_stream = match tcp_address {
        Some(address) => TcpStream::connect(address).await?,
        None => {
            let port = url
                .port_or_known_default()
                .ok_or(WebSocketError::InvalidHttpScheme)?;
            // the url crate keeps the brackets of IPv6 hosts
            let host = host.trim_start_matches('[').trim_end_matches(']');
            TcpStream::connect((host, port)).await?
        }
    };
    let _ = tcp_stream.set_nodelay(no_delay);

    if !tls {
        return Ok(MaybeTlsStream::Plain(tcp_stream));
    }

    let domain = ServerName::try_from(host.trim_start_matches('[').trim_end_matches(']').to_owned())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))?;
    let connector = match connector {
        Some(connector) => connector.clone(),
        None => tls_connector()?,
    };

    #[cfg(feature = "logging")]
    log::debug!("establishing TLS session with {host}");

    let stream = connector.connect(domain, tcp_stream).await?;
    Ok(MaybeTlsStream::Tls(Box::new(stream)))
}

/// Creates a TLS connector trusting the webpki root certificates.
fn tls_connector() -> Result<TlsConnector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec!["http/1.1".into()];

    Ok(TlsConnector::from(Arc::new(config)))
}
