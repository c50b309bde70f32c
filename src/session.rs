//! A registry of live connections, owned by a single task.
//!
//! The [`SessionManager`] handle sends commands to an actor task that owns every registered
//! [`WebSocket`]. No lock is shared between connections: broadcasting, counting and closing are all
//! serialized by the actor.
use std::{collections::HashMap, fmt, time::Duration};

use futures::future::join_all;
use tokio::{
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};

use crate::{close::CloseCode, Message, ReadyState, Result, WebSocket, WebSocketError};

/// How often closed sessions are dropped by default.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const COMMAND_BUFFER: usize = 256;

/// Opaque identifier of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

enum Command {
    Register {
        ws: WebSocket,
        reply: oneshot::Sender<SessionId>,
    },
    Unregister {
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Get {
        id: SessionId,
        reply: oneshot::Sender<Option<WebSocket>>,
    },
    Broadcast {
        message: Message,
        reply: oneshot::Sender<usize>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Sweep {
        reply: oneshot::Sender<usize>,
    },
    CloseAll {
        code: CloseCode,
        reason: String,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the registry. Cloning it is cheap; the actor stops once every handle was dropped.
#[derive(Clone, Debug)]
pub struct SessionManager {
    tx: mpsc::Sender<Command>,
}

impl SessionManager {
    /// Starts a registry sweeping closed sessions every [`SWEEP_INTERVAL`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self::with_sweep_interval(SWEEP_INTERVAL)
    }

    /// Starts a registry sweeping closed sessions every `interval`.
    pub fn with_sweep_interval(interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run(rx, interval));
        Self { tx }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Adds `ws` to the registry.
    pub async fn register(&self, ws: WebSocket) -> Result<SessionId> {
        self.request(|reply| Command::Register { ws, reply }).await
    }

    /// Removes a session. Returns whether it was registered.
    pub async fn unregister(&self, id: SessionId) -> Result<bool> {
        self.request(|reply| Command::Unregister { id, reply }).await
    }

    pub async fn get(&self, id: SessionId) -> Result<Option<WebSocket>> {
        self.request(|reply| Command::Get { id, reply }).await
    }

    /// Sends `message` to every open session, without waiting for the sends to complete. Returns the
    /// number of sessions it was sent to.
    pub async fn broadcast(&self, message: impl Into<Message>) -> Result<usize> {
        let message = message.into();
        self.request(|reply| Command::Broadcast { message, reply }).await
    }

    /// The number of registered sessions, closed ones included until the next sweep.
    pub async fn count(&self) -> Result<usize> {
        self.request(|reply| Command::Count { reply }).await
    }

    /// Drops the sessions that reached [`ReadyState::Closed`] now. Returns how many were dropped.
    pub async fn sweep(&self) -> Result<usize> {
        self.request(|reply| Command::Sweep { reply }).await
    }

    /// Closes every session with `code` and empties the registry. Resolves once every close handshake
    /// completed.
    pub async fn close_all(&self, code: CloseCode, reason: &str) -> Result<()> {
        let reason = reason.to_owned();
        self.request(|reply| Command::CloseAll {
            code,
            reason,
            reply,
        })
        .await
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn stopped() -> WebSocketError {
    WebSocketError::Internal("session manager stopped".into())
}

async fn run(mut rx: mpsc::Receiver<Command>, interval: Duration) {
    let mut sessions: HashMap<SessionId, WebSocket> = HashMap::new();
    let mut next_id = 0;

    let mut sweep_timer = tokio::time::interval(interval);
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                handle(&mut sessions, &mut next_id, command);
            }
            _ = sweep_timer.tick() => {
                sweep(&mut sessions);
            }
        }
    }

    #[cfg(feature = "logging")]
    log::debug!("session manager stopped with {} sessions", sessions.len());
}

fn handle(sessions: &mut HashMap<SessionId, WebSocket>, next_id: &mut u64, command: Command) {
    match command {
        Command::Register { ws, reply } => {
            let id = SessionId(*next_id);
            *next_id += 1;
            sessions.insert(id, ws);
            let _ = reply.send(id);
        }
        Command::Unregister { id, reply } => {
            let _ = reply.send(sessions.remove(&id).is_some());
        }
        Command::Get { id, reply } => {
            let _ = reply.send(sessions.get(&id).cloned());
        }
        Command::Broadcast { message, reply } => {
            let mut sent = 0;
            for ws in sessions.values() {
                if ws.ready_state() != ReadyState::Open {
                    continue;
                }
                let ws = ws.clone();
                let message = message.clone();
                tokio::spawn(async move {
                    if let Err(err) = ws.send_message(message).await {
                        #[cfg(feature = "logging")]
                        log::debug!("broadcast to {ws:?} failed: {err}");
                        #[cfg(not(feature = "logging"))]
                        let _ = err;
                    }
                });
                sent += 1;
            }
            let _ = reply.send(sent);
        }
        Command::Count { reply } => {
            let _ = reply.send(sessions.len());
        }
        Command::Sweep { reply } => {
            let _ = reply.send(sweep(sessions));
        }
        Command::CloseAll {
            code,
            reason,
            reply,
        } => {
            let closing: Vec<_> = sessions.drain().map(|(_, ws)| ws).collect();
            tokio::spawn(async move {
                join_all(closing.iter().map(|ws| ws.close_with(code, &reason))).await;
                let _ = reply.send(());
            });
        }
    }
}

fn sweep(sessions: &mut HashMap<SessionId, WebSocket>) -> usize {
    let before = sessions.len();
    sessions.retain(|_, ws| ws.ready_state() != ReadyState::Closed);
    let swept = before - sessions.len();

    if swept > 0 {
        #[cfg(feature = "logging")]
        log::debug!("swept {swept} closed sessions");
    }

    swept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Event, Options};

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
        assert!(matches!(client.recv().await, Some(Event::Open)));
        (client, server)
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let manager = SessionManager::new();
        let (_client, server) = connected().await;

        let first = manager.register(server.clone()).await.unwrap();
        let second = manager.register(server).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.count().await.unwrap(), 2);
        assert!(manager.get(first).await.unwrap().is_some());

        assert!(manager.unregister(first).await.unwrap());
        assert!(!manager.unregister(first).await.unwrap());
        assert!(manager.get(first).await.unwrap().is_none());
        assert_eq!(manager.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_broadcast() {
        let manager = SessionManager::new();
        let (client_a, server_a) = connected().await;
        let (client_b, server_b) = connected().await;
        manager.register(server_a).await.unwrap();
        manager.register(server_b).await.unwrap();

        assert_eq!(manager.broadcast("news").await.unwrap(), 2);
        for client in [client_a, client_b] {
            match client.recv().await {
                Some(Event::Message(message)) => assert_eq!(message.text(), "news"),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_sweep_and_close_all() {
        let manager = SessionManager::new();
        let (client_a, server_a) = connected().await;
        let (_client_b, server_b) = connected().await;
        manager.register(server_a.clone()).await.unwrap();
        manager.register(server_b.clone()).await.unwrap();

        client_a.close_with(CloseCode::Normal, "").await.unwrap();
        while server_a.ready_state() != ReadyState::Closed {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.sweep().await.unwrap(), 1);
        assert_eq!(manager.count().await.unwrap(), 1);

        manager.close_all(CloseCode::Away, "shutdown").await.unwrap();
        assert_eq!(server_b.ready_state(), ReadyState::Closed);
        assert_eq!(manager.count().await.unwrap(), 0);
    }
}
