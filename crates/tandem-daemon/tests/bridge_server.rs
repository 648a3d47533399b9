//! Bridge server tests over real sockets.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_core::protocol::{self, BridgeMessage, ChatRole};
use tandem_daemon::agent::{ConnectionState, SessionSnapshot};
use tandem_daemon::server::{BridgeServer, RemotePrompt, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (BridgeServer, SocketAddr, mpsc::Receiver<RemotePrompt>) {
    let (tx, rx) = mpsc::channel(16);
    let server = BridgeServer::new(
        ServerConfig::default().with_close_timeout(Duration::from_millis(300)),
        tx,
    );
    let addr = server.start(0).await.unwrap();
    (server, addr, rx)
}

async fn connect(server: &BridgeServer, addr: SocketAddr) -> Client {
    let before = server.connection_count().await;
    let url = format!("ws://127.0.0.1:{}/", addr.port());
    let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    wait_for_count(server, before + 1).await;
    client
}

async fn wait_for_count(server: &BridgeServer, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.connection_count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count reached");
}

async fn next_message(client: &mut Client) -> BridgeMessage {
    let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("frame within timeout")
        .unwrap()
        .unwrap();
    protocol::decode(frame.to_text().unwrap()).unwrap()
}

#[tokio::test]
async fn plain_http_gets_400_and_server_keeps_accepting() {
    let (server, addr, _rx) = start_server().await;

    let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 400"), "got: {response}");

    let _client = connect(&server, addr).await;
    assert_eq!(server.connection_count().await, 1);
    server.stop().await;
}

#[tokio::test]
async fn send_prompt_reaches_queue_with_connection_id() {
    let (server, addr, mut rx) = start_server().await;
    let mut client = connect(&server, addr).await;

    client
        .send(Message::Text(r#"{"type":"sendPrompt","prompt":"hi"}"#.into()))
        .await
        .unwrap();
    let prompt = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(prompt.prompt, "hi");
    assert!(prompt.connection_id.is_some());
    server.stop().await;
}

#[tokio::test]
async fn malformed_and_unexpected_frames_keep_the_connection() {
    let (server, addr, mut rx) = start_server().await;
    let mut client = connect(&server, addr).await;

    for frame in [
        "not json",
        r#"{"prompt":"no type"}"#,
        r#"{"type":"mystery"}"#,
        r#"{"type":"chatMessage","role":"user","content":"server-only","isDelta":false}"#,
    ] {
        client.send(Message::Text(frame.into())).await.unwrap();
    }
    client
        .send(Message::Text(r#"{"type":"sendPrompt","prompt":"still here"}"#.into()))
        .await
        .unwrap();

    let prompt = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(prompt.prompt, "still here");
    assert_eq!(server.connection_count().await, 1);
    server.stop().await;
}

#[tokio::test]
async fn broadcast_skips_departed_client() {
    let (server, addr, _rx) = start_server().await;
    let mut staying = connect(&server, addr).await;
    let mut leaving = connect(&server, addr).await;

    leaving.close(None).await.unwrap();
    drop(leaving);
    wait_for_count(&server, 1).await;

    let delivered = server
        .broadcast_chat(ChatRole::Assistant, "hello", false)
        .await;
    assert_eq!(delivered, 1);
    match next_message(&mut staying).await {
        BridgeMessage::ChatMessage(chat) => {
            assert_eq!(chat.content, "hello");
            assert!(!chat.is_delta);
        }
        other => panic!("unexpected {other:?}"),
    }
    server.stop().await;
}

#[tokio::test]
async fn clients_receive_frames_in_broadcast_order() {
    let (server, addr, _rx) = start_server().await;
    let mut a = connect(&server, addr).await;
    let mut b = connect(&server, addr).await;

    server.broadcast_chat_delta("one").await;
    server.broadcast_tool_event("Bash", true, None).await;
    server
        .broadcast_tool_event("Bash", false, Some("ok".into()))
        .await;

    for client in [&mut a, &mut b] {
        assert_eq!(next_message(client).await, BridgeMessage::chat_delta("one"));
        assert_eq!(next_message(client).await, BridgeMessage::tool_started("Bash"));
        assert_eq!(
            next_message(client).await,
            BridgeMessage::tool_completed("Bash", Some("ok".into()))
        );
    }
    server.stop().await;
}

#[tokio::test]
async fn late_client_receives_latest_state_first() {
    let (server, addr, _rx) = start_server().await;
    let snapshot = SessionSnapshot {
        state: ConnectionState::Busy,
        session_id: Some("s".into()),
        is_busy: true,
        current_intent: Some("Running tests".into()),
        ..SessionSnapshot::default()
    };
    server.broadcast_state(&snapshot).await;

    let mut client = connect(&server, addr).await;
    match next_message(&mut client).await {
        BridgeMessage::SessionState(state) => {
            assert!(state.is_connected);
            assert!(state.is_session_active);
            assert!(state.is_busy);
            assert_eq!(state.current_intent.as_deref(), Some("Running tests"));
        }
        other => panic!("unexpected {other:?}"),
    }
    server.stop().await;
}

#[tokio::test]
async fn stop_closes_every_client() {
    let (server, addr, _rx) = start_server().await;
    let mut client = connect(&server, addr).await;

    let stopping = tokio::spawn(async move {
        server.stop().await;
        server
    });

    let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .unwrap();
    assert!(matches!(frame, Some(Ok(Message::Close(_))) | None));

    let server = stopping.await.unwrap();
    assert!(!server.is_running());
    assert_eq!(server.connection_count().await, 0);
}
