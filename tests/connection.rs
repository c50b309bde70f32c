mod common;

use std::time::Duration;

use common::{client_and_raw_server, drain, listener, next, pair, url};
use wsengine::{
    close::CloseCode, frame::OpCode, Event, Message, Options, ReadyState, WebSocket, WebSocketError,
};

fn close_events(events: &[Event]) -> Vec<&wsengine::CloseEvent> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Close(close) => Some(close),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_exchange_messages() {
    let (client, server) = pair(Options::default()).await;
    assert_eq!(client.ready_state(), ReadyState::Open);

    client.send_text("hello").await.unwrap();
    client.send_binary(vec![1u8, 2, 3]).await.unwrap();

    match server.recv().await {
        Some(Event::Message(message)) => {
            assert!(message.is_text());
            assert_eq!(message.as_text(), Some("hello"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    match server.recv().await {
        Some(Event::Message(message)) => {
            assert!(message.is_binary());
            assert_eq!(&message.data()[..], &[1, 2, 3]);
        }
        other => panic!("unexpected event {other:?}"),
    }

    server.send_text("world").await.unwrap();
    match client.recv().await {
        Some(Event::Message(message)) => assert_eq!(message.text(), "world"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_fragmented_messages_are_reassembled() {
    let (client, server) = pair(Options::default().with_fragment_size(10)).await;

    let text = "a fairly long message split into many frames";
    client.send_text(text).await.unwrap();
    match server.recv().await {
        Some(Event::Message(message)) => assert_eq!(message.text(), text),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_send_message_rejects_non_data_opcodes() {
    let (client, server) = pair(Options::default()).await;

    for opcode in [OpCode::Close, OpCode::Ping, OpCode::Pong, OpCode::Continuation] {
        let result = client.send_message(Message::new(opcode, vec![0u8; 2000])).await;
        match result {
            Err(WebSocketError::InvalidMessageOpCode(rejected)) => assert_eq!(rejected, opcode),
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert_eq!(client.ready_state(), ReadyState::Open);

    client.send_message(Message::from("still open")).await.unwrap();
    match server.recv().await {
        Some(Event::Message(message)) => assert_eq!(message.text(), "still open"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_send_before_connect() {
    let client = WebSocket::client("ws://127.0.0.1:9/".parse().unwrap())
        .build()
        .unwrap();
    assert_eq!(client.ready_state(), ReadyState::Connecting);

    assert!(matches!(
        client.send_text("early").await,
        Err(WebSocketError::InvalidState(ReadyState::Connecting))
    ));
    assert!(!client.ping().await.unwrap());
}

#[tokio::test]
async fn test_send_while_closing() {
    let options = Options::default().with_wait_time(Duration::from_millis(200));
    let (client, mut peer) = client_and_raw_server(options, false).await;

    let closing = tokio::spawn({
        let client = client.clone();
        async move { client.close_with(CloseCode::Normal, "bye").await }
    });

    // the peer sees the close frame but never answers it
    let frame = next(&mut peer).await;
    assert_eq!(frame.opcode, OpCode::Close);
    assert_eq!(client.ready_state(), ReadyState::Closing);
    assert!(matches!(
        client.send_text("late").await,
        Err(WebSocketError::InvalidState(ReadyState::Closing))
    ));

    closing.await.unwrap().unwrap();
    assert_eq!(client.ready_state(), ReadyState::Closed);
    let events = drain(&client).await;
    let closes = close_events(&events);
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].code, CloseCode::Abnormal);
    assert!(!closes[0].was_clean);
    drop(peer);
}

#[tokio::test]
async fn test_send_reader() {
    let (client, server) = pair(Options::default()).await;

    client.send_reader(&b"hello world"[..], 5).await.unwrap();
    match server.recv().await {
        Some(Event::Message(message)) => assert_eq!(&message.data()[..], b"hello"),
        other => panic!("unexpected event {other:?}"),
    }

    assert!(matches!(
        client.send_reader(&b""[..], 10).await,
        Err(WebSocketError::NoData)
    ));
}

#[tokio::test]
async fn test_ping() {
    let (client, server) = pair(Options::default()).await;

    assert!(client.ping().await.unwrap());
    assert!(server.ping_with("payload").await.unwrap());
    assert!(matches!(
        client.ping_with(vec![0u8; 126]).await,
        Err(WebSocketError::ControlFrameTooLarge)
    ));

    client.close_with(CloseCode::Normal, "").await.unwrap();
    assert!(!client.ping().await.unwrap());
}

#[tokio::test]
async fn test_unanswered_ping() {
    let options = Options::default().with_wait_time(Duration::from_millis(100));
    let (client, mut peer) = client_and_raw_server(options, false).await;

    assert!(!client.ping_with("anyone").await.unwrap());
    assert_eq!(client.ready_state(), ReadyState::Open);

    let frame = next(&mut peer).await;
    assert_eq!(frame.opcode, OpCode::Ping);
    assert_eq!(&frame.payload[..], b"anyone");
}

#[tokio::test]
async fn test_ping_events() {
    let (client, server) = pair(Options::default().with_ping_events()).await;

    assert!(server.ping_with("marco").await.unwrap());
    match client.recv().await {
        Some(Event::Ping(payload)) => assert_eq!(&payload[..], b"marco"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_clean_close() {
    let (client, server) = pair(Options::default()).await;

    client.close_with(CloseCode::Normal, "done").await.unwrap();
    assert_eq!(client.ready_state(), ReadyState::Closed);

    let events = drain(&client).await;
    let closes = close_events(&events);
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].code, CloseCode::Normal);
    assert!(closes[0].was_clean);

    let events = drain(&server).await;
    let closes = close_events(&events);
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].code, CloseCode::Normal);
    assert_eq!(closes[0].reason, "done");
    assert!(closes[0].was_clean);
}

#[tokio::test]
async fn test_close_without_status() {
    let (client, server) = pair(Options::default()).await;

    server.close().await.unwrap();

    let events = drain(&client).await;
    let closes = close_events(&events);
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].code, CloseCode::Status);
    assert!(closes[0].was_clean);
}

#[tokio::test]
async fn test_concurrent_close_emits_one_event() {
    let (client, server) = pair(Options::default()).await;

    let (a, b, c) = tokio::join!(
        client.close_with(CloseCode::Normal, ""),
        client.close_with(CloseCode::Away, ""),
        server.close_with(CloseCode::Normal, ""),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(close_events(&drain(&client).await).len(), 1);
    assert_eq!(close_events(&drain(&server).await).len(), 1);
    assert_eq!(client.ready_state(), ReadyState::Closed);
    assert_eq!(server.ready_state(), ReadyState::Closed);
}

#[tokio::test]
async fn test_send_after_close() {
    let (client, _server) = pair(Options::default()).await;

    client.close_with(CloseCode::Normal, "").await.unwrap();
    assert!(matches!(
        client.send_text("late").await,
        Err(WebSocketError::InvalidState(ReadyState::Closed))
    ));
    // closing twice does nothing
    client.close_with(CloseCode::Normal, "").await.unwrap();
}

#[tokio::test]
async fn test_close_arguments_are_validated() {
    let (client, server) = pair(Options::default()).await;

    assert!(matches!(
        client.close_with(CloseCode::Abnormal, "").await,
        Err(WebSocketError::InvalidCloseCode(1006))
    ));
    assert!(matches!(
        client.close_with(CloseCode::Error, "").await,
        Err(WebSocketError::InvalidCloseCode(1011))
    ));
    assert!(matches!(
        server.close_with(CloseCode::Extension, "").await,
        Err(WebSocketError::InvalidCloseCode(1010))
    ));
    assert!(matches!(
        client.close_with(CloseCode::Normal, &"x".repeat(124)).await,
        Err(WebSocketError::InvalidCloseReason)
    ));
    assert_eq!(client.ready_state(), ReadyState::Open);

    client.close_with(CloseCode::Library(4000), "app").await.unwrap();
    let events = drain(&server).await;
    assert_eq!(close_events(&events)[0].code, CloseCode::Library(4000));
}

#[tokio::test]
async fn test_reconnect_limit() {
    let (listener, addr) = listener().await;
    drop(listener);

    let client = WebSocket::client(url(addr, "/"))
        .with_options(Options::default().with_max_retries(1))
        .build()
        .unwrap();

    assert!(matches!(client.connect().await, Err(WebSocketError::IoError(_))));
    assert_eq!(client.ready_state(), ReadyState::Closed);
    assert!(matches!(client.connect().await, Err(WebSocketError::IoError(_))));
    assert!(matches!(
        client.connect().await,
        Err(WebSocketError::RetryLimitExceeded)
    ));
}

#[tokio::test]
async fn test_reconnect_opens_a_new_session() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        for _ in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = WebSocket::server(stream, Options::default());
            ws.accept().await.unwrap();
            ws.close_with(CloseCode::Restart, "again").await.unwrap();
        }
    });

    let client = WebSocket::client(url(addr, "/")).await.unwrap();
    assert!(matches!(client.recv().await, Some(Event::Open)));
    match client.recv().await {
        Some(Event::Close(close)) => assert_eq!(close.code, CloseCode::Restart),
        other => panic!("unexpected event {other:?}"),
    }
    while client.ready_state() != ReadyState::Closed {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    client.connect().await.unwrap();
    assert!(matches!(client.recv().await, Some(Event::Open)));
    match client.recv().await {
        Some(Event::Close(close)) => assert_eq!(close.reason, "again"),
        other => panic!("unexpected event {other:?}"),
    }
    server.await.unwrap();
}
