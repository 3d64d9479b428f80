//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tandem_sync::client::{ChangeOrigin, ConnectionState, SyncClient, SyncEvent};
use tandem_sync::protocol::{Frame, MessageKind};
use tandem_sync::server::{ServerConfig, SyncServer};
use tandem_sync::storage::{MemoryStore, PersistenceGateway};
use tandem_sync::crdt::Document;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct TestServer {
    url: String,
    server: SyncServer,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        broadcast_capacity: 64,
        save_debounce: Duration::from_secs(30),
        save_max_debounce: Duration::from_secs(60),
        maintenance_interval: Duration::from_millis(100),
        ..ServerConfig::default()
    }
}

/// Start a server on a free port.
async fn start_server_with(gateway: Arc<dyn PersistenceGateway>) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::with_gateway(test_config(), gateway);
    let (shutdown, signal) = oneshot::channel::<()>();
    let running = server.clone();
    let handle = tokio::spawn(async move {
        running
            .serve(listener, async move {
                let _ = signal.await;
            })
            .await
    });
    TestServer {
        url: format!("ws://127.0.0.1:{port}"),
        server,
        shutdown,
        handle,
    }
}

async fn start_test_server() -> TestServer {
    start_server_with(Arc::new(MemoryStore::new())).await
}

/// Poll `check` until it holds or three seconds pass.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = timeout(Duration::from_secs(3), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("no event within timeout")
        .expect("event channel closed")
}

async fn connected_client(url: &str, room: &str, replica: u64) -> SyncClient {
    let mut client = SyncClient::with_replica(url, room, replica);
    client.connect().await.unwrap();
    eventually("handshake", || async {
        client.state().await == ConnectionState::Synchronized
    })
    .await;
    client
}

#[tokio::test]
async fn test_client_handshake_events() {
    let server = start_test_server().await;
    let mut client = SyncClient::with_replica(&server.url, "handshake", 1);
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SyncEvent::Connected);
    assert_eq!(next_event(&mut events).await, SyncEvent::Synchronized);
    assert_eq!(client.state().await, ConnectionState::Synchronized);
    assert_eq!(server.server.rooms().session_count("handshake").await, 1);

    client.disconnect().await;
    assert_eq!(next_event(&mut events).await, SyncEvent::Disconnected);
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    server.stop().await;
}

#[tokio::test]
async fn test_late_joiner_reads_existing_text() {
    let server = start_test_server().await;

    let alice = connected_client(&server.url, "abc", 1).await;
    alice.edit(0..0, "hello").await.unwrap();
    eventually("server to merge", || async {
        match server.server.rooms().room("abc").await {
            Some(room) => room.text().await == "hello",
            None => false,
        }
    })
    .await;

    let bob = connected_client(&server.url, "abc", 2).await;
    assert_eq!(bob.text().await, "hello");
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_inserts_converge() {
    let server = start_test_server().await;
    let mut a = SyncClient::with_replica(&server.url, "race", 1);
    let mut b = SyncClient::with_replica(&server.url, "race", 2);

    // Both edit the empty document before either has seen the other.
    a.edit(0..0, "foo").await.unwrap();
    b.edit(0..0, "bar").await.unwrap();
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    eventually("convergence", || async {
        a.text().await == "foobar" && b.text().await == "foobar"
    })
    .await;

    let room = server.server.rooms().room("race").await.unwrap();
    assert_eq!(room.text().await, "foobar");
    server.stop().await;
}

#[tokio::test]
async fn test_live_edits_are_relayed() {
    let server = start_test_server().await;
    let alice = connected_client(&server.url, "live", 10).await;
    let mut bob = connected_client(&server.url, "live", 20).await;
    let mut bob_events = bob.take_event_rx().unwrap();

    alice.edit(0..0, "abc").await.unwrap();
    eventually("bob to see abc", || async { bob.text().await == "abc" }).await;

    let mut saw_remote = false;
    while let Ok(event) = bob_events.try_recv() {
        if let SyncEvent::TextChanged { origin, .. } = event {
            saw_remote |= origin == ChangeOrigin::Remote;
        }
    }
    assert!(saw_remote);

    bob.edit(3..3, "def").await.unwrap();
    alice.edit(0..1, "").await.unwrap();
    eventually("both to converge", || async {
        let (a, b) = (alice.text().await, bob.text().await);
        a == b && a == "bcdef"
    })
    .await;
    server.stop().await;
}

#[tokio::test]
async fn test_offline_edits_delivered_on_reconnect() {
    let server = start_test_server().await;
    let mut client = connected_client(&server.url, "offline", 3).await;
    let observer = connected_client(&server.url, "offline", 4).await;

    client.disconnect().await;
    client.edit(0..0, "written offline").await.unwrap();
    assert_eq!(observer.text().await, "");

    client.connect().await.unwrap();
    eventually("offline edit to arrive", || async {
        observer.text().await == "written offline"
    })
    .await;
    server.stop().await;
}

async fn raw_socket(
    url: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    // The server opens with its state vector.
    let first = timeout(Duration::from_secs(3), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match first {
        WsMessage::Binary(bytes) => {
            assert_eq!(Frame::decode(&bytes).unwrap().kind, MessageKind::SyncStep1)
        }
        other => panic!("unexpected {other:?}"),
    }
    ws
}

#[tokio::test]
async fn test_unsupported_version_closes_with_protocol_error() {
    let server = start_test_server().await;
    let mut ws = raw_socket(&format!("{}/versioned", server.url)).await;

    let future_version = Frame::new(MessageKind::Update, vec![99, 0]).encode();
    ws.send(WsMessage::Binary(future_version.into())).await.unwrap();

    let close = timeout(Duration::from_secs(3), async {
        while let Some(Ok(message)) = ws.next().await {
            if let WsMessage::Close(frame) = message {
                return frame;
            }
        }
        None
    })
    .await
    .unwrap()
    .expect("close frame");
    assert_eq!(close.code, CloseCode::Protocol);
    assert!(close.reason.as_str().contains("version"));

    eventually("session to be released", || async {
        server.server.rooms().session_count("versioned").await == 0
    })
    .await;
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let server = start_test_server().await;
    let mut ws = raw_socket(&format!("{}/sturdy", server.url)).await;

    ws.send(WsMessage::Binary(vec![MessageKind::Update as u8, 5, 1].into()))
        .await
        .unwrap();
    ws.send(WsMessage::Binary(vec![42, 0].into())).await.unwrap();
    ws.send(WsMessage::Binary(Frame::query_awareness().encode().into()))
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(3), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match reply {
        WsMessage::Binary(bytes) => {
            assert_eq!(
                Frame::decode(&bytes).unwrap().kind,
                MessageKind::AwarenessUpdate
            )
        }
        other => panic!("unexpected {other:?}"),
    }
    eventually("rejections to be counted", || async {
        server.server.stats().await.rejected_messages == 2
    })
    .await;
    server.stop().await;
}

#[tokio::test]
async fn test_raw_update_is_relayed_verbatim() {
    let server = start_test_server().await;
    let mut sender = raw_socket(&format!("{}/verbatim", server.url)).await;
    let mut receiver = raw_socket(&format!("{}/verbatim", server.url)).await;

    let update = Frame::update(&Document::new(77).apply_local_edit(0..0, "exact")).encode();
    sender
        .send(WsMessage::Binary(update.clone().into()))
        .await
        .unwrap();

    let relayed = timeout(Duration::from_secs(3), receiver.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(relayed, WsMessage::Binary(update.into()));
    server.stop().await;
}

#[tokio::test]
async fn test_connection_stats() {
    let server = start_test_server().await;
    let mut client = connected_client(&server.url, "stats", 1).await;
    let stats = server.server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_rooms, 1);

    client.disconnect().await;
    eventually("connection to close", || async {
        let stats = server.server.stats().await;
        stats.active_connections == 0 && stats.active_rooms == 0
    })
    .await;
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_flushes_dirty_rooms() {
    let store = Arc::new(MemoryStore::new());
    let server = start_server_with(store.clone()).await;
    let client = connected_client(&server.url, "flush-me", 5).await;
    client.edit(0..0, "keep this").await.unwrap();

    let rooms = server.server.rooms().clone();
    eventually("server to merge", || async {
        match rooms.room("flush-me").await {
            Some(room) => room.is_dirty(),
            None => false,
        }
    })
    .await;
    assert_eq!(store.save_count(), 0);

    server.stop().await;
    let saved = Document::from_state(1, &store.get("flush-me").unwrap()).unwrap();
    assert_eq!(saved.text(), "keep this");
}
