//! A small WebSocket server: a TCP listener routing request paths to handlers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use wsengine::{handler::Handler, server::Server, Options};
//!
//! struct Silent;
//!
//! impl Handler for Silent {}
//!
//! async fn run() -> wsengine::Result<()> {
//!     let server = Arc::new(Server::new(Options::default()).route("/silent", || Silent));
//!     let listener = TcpListener::bind("127.0.0.1:9001").await?;
//!
//!     let stopper = Arc::clone(&server);
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         stopper.shutdown().await;
//!     });
//!
//!     server.run(listener).await
//! }
//! ```
use std::{collections::HashMap, sync::Arc};

use bytes::BytesMut;
use http::StatusCode;
use tokio::{io::AsyncWriteExt, net::TcpListener, sync::watch, time::timeout};

use crate::{
    close::CloseCode,
    handler::{serve, Handler},
    handshake,
    session::SessionManager,
    stream::Transport,
    Options, Result, WebSocket, WebSocketError,
};

type Factory = Box<dyn Fn() -> Arc<dyn Handler> + Send + Sync>;

struct Route {
    factory: Factory,
    sessions: SessionManager,
}

/// Routes WebSocket connections to handlers by request path.
///
/// Every route owns a [`SessionManager`] tracking its connections, which can be used to broadcast.
/// Requests for unknown paths are answered with `404 Not Found`.
pub struct Server {
    options: Options,
    routes: HashMap<String, Route>,
    stop: watch::Sender<bool>,
}

impl Server {
    pub fn new(options: Options) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            options,
            routes: HashMap::new(),
            stop,
        }
    }

    /// Serves `path` with handlers created by `factory`, one per connection.
    ///
    /// Must be called from within a Tokio runtime, as it starts the session manager of the route.
    pub fn route<H, F>(mut self, path: impl Into<String>, factory: F) -> Self
    where
        H: Handler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: Factory = Box::new(move || Arc::new(factory()) as Arc<dyn Handler>);
        self.routes.insert(
            path.into(),
            Route {
                factory,
                sessions: SessionManager::new(),
            },
        );
        self
    }

    /// The sessions connected to `path`.
    pub fn sessions(&self, path: &str) -> Option<&SessionManager> {
        self.routes.get(path).map(|route| &route.sessions)
    }

    /// Accepts connections until [`shutdown`](Server::shutdown) is called. Each connection is served on its
    /// own task.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut stop = self.stop.subscribe();

        #[cfg(feature = "logging")]
        log::info!("listening on {:?}", listener.local_addr());

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
            };
            let _ = stream.set_nodelay(self.options.no_delay);

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream).await {
                    #[cfg(feature = "logging")]
                    log::debug!("connection from {peer} failed: {err}");
                    #[cfg(not(feature = "logging"))]
                    let _ = (peer, err);
                }
            });
        }
    }

    /// Runs the handshake on `io`, then serves the connection until it is closed.
    pub async fn handle_connection(&self, io: impl Transport) -> Result<()> {
        let mut io: Box<dyn Transport> = Box::new(io);
        let mut buffered = BytesMut::new();

        let request = match timeout(
            self.options.handshake_timeout,
            handshake::read_request(&mut io, &mut buffered),
        )
        .await
        {
            Ok(request) => request?,
            Err(_) => return Err(WebSocketError::HandshakeTimeout),
        };

        let Some(route) = self.routes.get(request.uri().path()) else {
            #[cfg(feature = "logging")]
            log::debug!("no route for {}", request.uri().path());

            handshake::write_response(&mut io, &handshake::status_response(StatusCode::NOT_FOUND)).await?;
            io.shutdown().await?;
            return Ok(());
        };

        let ws = WebSocket::server_with_request(io, request, buffered, self.options.clone());
        ws.accept().await?;

        let id = route.sessions.register(ws.clone()).await?;
        serve(ws, (route.factory)()).await;
        route.sessions.unregister(id).await?;
        Ok(())
    }

    /// Stops accepting connections and closes every session with 1001 (going away).
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        for route in self.routes.values() {
            let _ = route
                .sessions
                .close_all(CloseCode::Away, "server shutting down")
                .await;
        }
    }
}
