//! Upgrading requests received by a hyper server.
use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use pin_project::pin_project;

use super::WebSocket;
use crate::{
    handshake::{self, HttpRequest, Negotiation},
    Options, Result, WebSocketError,
};

impl WebSocket {
    /// Validates a WebSocket upgrade request received by a hyper server.
    ///
    /// Returns the `101 Switching Protocols` response to send back and a future resolving to the open
    /// server socket once hyper hands the connection over. On error, the request is not an acceptable
    /// upgrade and should be answered with `400 Bad Request`.
    ///
    /// ```no_run
    /// use bytes::Bytes;
    /// use http_body_util::Empty;
    /// use hyper::{body::Incoming, Request, Response};
    /// use wsengine::{Event, Options, WebSocket};
    ///
    /// async fn handle(mut req: Request<Incoming>) -> wsengine::Result<Response<Empty<Bytes>>> {
    ///     let (response, fut) = WebSocket::upgrade(&mut req, Options::default())?;
    ///
    ///     tokio::spawn(async move {
    ///         if let Ok(ws) = fut.await {
    ///             while let Some(Event::Message(message)) = ws.recv().await {
    ///                 let _ = ws.send_message(message).await;
    ///             }
    ///         }
    ///     });
    ///
    ///     Ok(response)
    /// }
    /// ```
    pub fn upgrade<B>(
        request: &mut hyper::Request<B>,
        options: Options,
    ) -> Result<(hyper::Response<Empty<Bytes>>, UpgradeFut)> {
        let mut head = HttpRequest::new(());
        *head.method_mut() = request.method().clone();
        *head.uri_mut() = request.uri().clone();
        *head.version_mut() = request.version();
        *head.headers_mut() = request.headers().clone();

        let (response, negotiation) = handshake::negotiate(&head, &options)?;
        let (parts, ()) = response.into_parts();

        let fut = UpgradeFut {
            inner: hyper::upgrade::on(request),
            upgrade: Some((options, negotiation)),
        };
        Ok((hyper::Response::from_parts(parts, Empty::new()), fut))
    }
}

/// Resolves to an open server [`WebSocket`] once hyper completed the protocol switch.
#[pin_project]
pub struct UpgradeFut {
    #[pin]
    inner: OnUpgrade,
    upgrade: Option<(Options, Negotiation)>,
}

impl Future for UpgradeFut {
    type Output = Result<WebSocket>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = ready!(this.inner.poll(cx))?;

        let Some((options, negotiation)) = this.upgrade.take() else {
            return Poll::Ready(Err(WebSocketError::Internal(
                "upgrade polled after completion".into(),
            )));
        };

        Poll::Ready(Ok(WebSocket::upgraded(
            Box::new(TokioIo::new(upgraded)),
            options,
            negotiation,
        )))
    }
}
