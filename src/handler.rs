//! Application behaviour attached to connections.
//!
//! A [`Handler`] reacts to the events of a connection. [`serve`] feeds it the events of one
//! [`WebSocket`], one callback at a time, until the session is closed.
use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::{
    future::{self, BoxFuture},
    FutureExt,
};

use crate::{
    websocket::panic_message, CloseEvent, Event, Message, WebSocket, WebSocketError,
};

/// Callbacks invoked for the events of a connection. Every callback defaults to doing nothing.
///
/// Callbacks return boxed futures so that handlers can be used as trait objects. The next event is only
/// delivered once the previous callback completed.
///
/// # Example
/// ```rust
/// use futures::{future::BoxFuture, FutureExt};
/// use wsengine::{handler::Handler, Message, WebSocket};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     fn on_message<'a>(&'a self, ws: &'a WebSocket, message: Message) -> BoxFuture<'a, ()> {
///         async move {
///             let _ = ws.send_message(message).await;
///         }
///         .boxed()
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// The handshake completed.
    fn on_open<'a>(&'a self, ws: &'a WebSocket) -> BoxFuture<'a, ()> {
        let _ = ws;
        future::ready(()).boxed()
    }

    fn on_message<'a>(&'a self, ws: &'a WebSocket, message: Message) -> BoxFuture<'a, ()> {
        let _ = (ws, message);
        future::ready(()).boxed()
    }

    /// The connection failed, or a callback panicked. `on_close` follows.
    fn on_error<'a>(&'a self, ws: &'a WebSocket, error: WebSocketError) -> BoxFuture<'a, ()> {
        let _ = (ws, error);
        future::ready(()).boxed()
    }

    fn on_close<'a>(&'a self, ws: &'a WebSocket, event: CloseEvent) -> BoxFuture<'a, ()> {
        let _ = (ws, event);
        future::ready(()).boxed()
    }
}

/// Delivers the events of `ws` to `handler` until the session is closed.
///
/// A panicking callback is reported to [`Handler::on_error`] and fails the connection with an internal
/// error (1011 for a server).
pub async fn serve<H>(ws: WebSocket, handler: Arc<H>)
where
    H: Handler + ?Sized,
{
    while let Some(event) = ws.recv().await {
        let callback = match event {
            Event::Open => handler.on_open(&ws),
            Event::Message(message) => handler.on_message(&ws, message),
            Event::Error(error) => handler.on_error(&ws, error),
            Event::Close(close) => handler.on_close(&ws, close),
            Event::Ping(_) => continue,
        };

        if let Err(panic) = AssertUnwindSafe(callback).catch_unwind().await {
            let message = format!("handler panicked: {}", panic_message(panic.as_ref()));

            #[cfg(feature = "logging")]
            log::error!("{message}");

            ws.fail(WebSocketError::Internal(message)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{close::CloseCode, Options};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        panic_on: Option<&'static str>,
    }

    impl Handler for Recorder {
        fn on_open<'a>(&'a self, _ws: &'a WebSocket) -> BoxFuture<'a, ()> {
            self.seen.lock().unwrap().push("open".into());
            future::ready(()).boxed()
        }

        fn on_message<'a>(&'a self, _ws: &'a WebSocket, message: Message) -> BoxFuture<'a, ()> {
            async move {
                if self.panic_on == Some(message.text()) {
                    panic!("cannot handle {}", message.text());
                }
                self.seen.lock().unwrap().push(format!("message {}", message.text()));
            }
            .boxed()
        }

        fn on_error<'a>(&'a self, _ws: &'a WebSocket, error: WebSocketError) -> BoxFuture<'a, ()> {
            self.seen.lock().unwrap().push(format!("error {error}"));
            future::ready(()).boxed()
        }

        fn on_close<'a>(&'a self, _ws: &'a WebSocket, event: CloseEvent) -> BoxFuture<'a, ()> {
            self.seen.lock().unwrap().push(format!("close {}", u16::from(event.code)));
            future::ready(()).boxed()
        }
    }

    async fn connected() -> (WebSocket, WebSocket) {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let client = WebSocket::client("ws://localhost/".parse().unwrap())
            .with_io(client_io)
            .build()
            .unwrap();
        let server = WebSocket::server(server_io, Options::default());
        let (connected, accepted) = tokio::join!(client.connect(), server.accept());
        connected.unwrap();
        accepted.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let (client, server) = connected().await;
        let handler = Arc::new(Recorder::default());
        let task = tokio::spawn(serve(server, Arc::clone(&handler)));

        client.send_text("one").await.unwrap();
        client.send_text("two").await.unwrap();
        client.close_with(CloseCode::Normal, "").await.unwrap();
        task.await.unwrap();

        assert_eq!(
            *handler.seen.lock().unwrap(),
            ["open", "message one", "message two", "close 1000"]
        );
    }

    #[tokio::test]
    async fn test_panicking_callback_fails_connection() {
        let (client, server) = connected().await;
        let handler = Arc::new(Recorder {
            panic_on: Some("boom"),
            ..Default::default()
        });
        let task = tokio::spawn(serve(server, Arc::clone(&handler)));

        client.send_text("boom").await.unwrap();
        task.await.unwrap();

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen[0], "open");
        assert!(seen[1].starts_with("error Internal error: handler panicked"));
        assert_eq!(seen[2], "close 1011");

        let mut close = None;
        while let Some(event) = client.recv().await {
            if let Event::Close(event) = event {
                close = Some(event);
            }
        }
        assert_eq!(close.unwrap().code, CloseCode::Error);
    }
}
