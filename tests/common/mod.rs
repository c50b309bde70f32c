#![allow(dead_code)]

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::codec::Framed;
use url::Url;
use wsengine::{
    codec::{Codec, Decoder, Encoder},
    frame::Frame,
    handshake::accept_key,
    Event, Options, Role, WebSocket,
};

pub const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const MAX: usize = 1 << 20;

pub type RawPeer = Framed<TcpStream, Codec>;

pub async fn listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub fn url(addr: SocketAddr, path: &str) -> Url {
    format!("ws://{addr}{path}").parse().unwrap()
}

/// Reads an HTTP head byte by byte so that nothing after it is consumed.
pub async fn read_head<S: AsyncRead + Unpin>(io: &mut S) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(io.read_u8().await.unwrap());
    }
    String::from_utf8(head).unwrap()
}

/// Logs to stderr at the level set by `RUST_LOG`, nothing by default.
pub fn init_logging() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Off)
        .env()
        .init();
}

/// A connected pair of engine sockets over loopback TCP.
pub async fn pair(options: Options) -> (WebSocket, WebSocket) {
    init_logging();
    let (listener, addr) = listener().await;
    let server_options = options.clone();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = WebSocket::server(stream, server_options);
        ws.accept().await.unwrap();
        ws
    });

    let client = WebSocket::client(url(addr, "/"))
        .with_options(options)
        .await
        .unwrap();
    let server = server.await.unwrap();

    assert!(matches!(client.recv().await, Some(Event::Open)));
    assert!(matches!(server.recv().await, Some(Event::Open)));
    (client, server)
}

/// An engine server accepting one connection, and a hand-driven client speaking to it.
///
/// The raw client does not mask its frames unless `masked` is set.
pub async fn server_and_raw_client(options: Options, masked: bool) -> (WebSocket, RawPeer) {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = WebSocket::server(stream, options);
        ws.accept().await.unwrap();
        ws
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
        Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    assert!(head.contains(&accept_key(KEY)));

    let encoder = Encoder::new(if masked { Role::Client } else { Role::Server });
    let codec = Codec::from((Decoder::new(Role::Client, MAX, false), encoder));
    let ws = server.await.unwrap();
    assert!(matches!(ws.recv().await, Some(Event::Open)));
    (ws, Framed::new(stream, codec))
}

/// A hand-driven server accepting one connection, and an engine client connected to it.
///
/// The raw server masks its frames when `masked` is set.
pub async fn client_and_raw_server(options: Options, masked: bool) -> (WebSocket, RawPeer) {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let key = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("sec-websocket-key"))
            .map(|(_, value)| value.trim().to_owned())
            .unwrap();

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
            Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&key)
        );
        stream.write_all(response.as_bytes()).await.unwrap();

        let encoder = Encoder::new(if masked { Role::Client } else { Role::Server });
        Framed::new(stream, Codec::from((Decoder::new(Role::Server, MAX, false), encoder)))
    });

    let client = WebSocket::client(url(addr, "/"))
        .with_options(options)
        .await
        .unwrap();
    assert!(matches!(client.recv().await, Some(Event::Open)));
    (client, server.await.unwrap())
}

/// Sends a frame from the raw peer.
pub async fn send(peer: &mut RawPeer, frame: Frame) {
    peer.send(frame).await.unwrap();
}

/// The next frame received by the raw peer.
pub async fn next(peer: &mut RawPeer) -> Frame {
    peer.next().await.unwrap().unwrap()
}

/// Drains `ws` and returns every event left, the close event last.
pub async fn drain(ws: &WebSocket) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = ws.recv().await {
        events.push(event);
    }
    events
}
