//! WebSocket sync client for editors.
//!
//! Provides:
//! - Connection lifecycle (connect, handshake, disconnect)
//! - Local edits applied immediately and shipped as `Update` frames
//! - Remote updates merged into the local replica
//! - Awareness (user / cursor) publishing and peer tracking
//!
//! Edits made while disconnected stay in the local document; the handshake
//! of the next `connect` delivers them, so no separate offline queue exists.
//!
//! Reference: Kleppmann, Chapter 5 (Replication)

use futures_util::{SinkExt, StreamExt};
use std::ops::Range;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::awareness::{AwarenessChange, AwarenessState, AwarenessStore};
use crate::crdt::{Document, TextChange};
use crate::protocol::{Frame, Message, ProtocolError};
use crate::update::{StateVector, Update};

/// How often a connected client re-announces its presence. Half of the
/// server's default awareness timeout.
pub const DEFAULT_AWARENESS_RENEWAL: Duration = Duration::from_secs(15);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected, waiting for the server's `SyncStep2`.
    Handshaking,
    Synchronized,
}

/// Who caused a text change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// The server's state has been merged
    Synchronized,
    /// The visible text changed
    TextChanged {
        changes: Vec<TextChange>,
        origin: ChangeOrigin,
    },
    /// Remote presence changed
    Awareness {
        added: Vec<u64>,
        updated: Vec<u64>,
        removed: Vec<u64>,
    },
    /// Connection lost or closed
    Disconnected,
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

struct LocalAwareness {
    clock: u64,
    state: Option<AwarenessState>,
}

/// State shared with the reader task.
struct Shared {
    client_id: u64,
    doc: Mutex<Document>,
    peers: StdMutex<AwarenessStore>,
    local: Mutex<LocalAwareness>,
    state: RwLock<ConnectionState>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    fn lock_peers(&self) -> MutexGuard<'_, AwarenessStore> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The sync client.
///
/// Holds a full replica of one room's document. The replica id doubles as the
/// awareness client id.
pub struct SyncClient {
    server_url: String,
    room_id: String,
    shared: Arc<Shared>,
    outgoing_tx: Option<mpsc::Sender<Outgoing>>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    awareness_renewal: Duration,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    renewal: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// `server_url` is the `ws://host:port` base; the room id is appended.
    pub fn new(server_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self::with_replica(server_url, room_id, Uuid::new_v4().as_u64_pair().0)
    }

    /// Client with a fixed replica id.
    pub fn with_replica(
        server_url: impl Into<String>,
        room_id: impl Into<String>,
        replica: u64,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            shared: Arc::new(Shared {
                client_id: replica,
                doc: Mutex::new(Document::new(replica)),
                peers: StdMutex::new(AwarenessStore::new()),
                local: Mutex::new(LocalAwareness {
                    clock: 0,
                    state: None,
                }),
                state: RwLock::new(ConnectionState::Disconnected),
                event_tx,
            }),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            awareness_renewal: DEFAULT_AWARENESS_RENEWAL,
            reader: None,
            writer: None,
            renewal: None,
        }
    }

    /// Re-announce presence every `period` while connected. Keep it below
    /// the server's awareness timeout.
    pub fn with_awareness_renewal(mut self, period: Duration) -> Self {
        self.awareness_renewal = period.max(Duration::from_millis(1));
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn client_id(&self) -> u64 {
        self.shared.client_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub async fn text(&self) -> String {
        self.shared.doc.lock().await.text()
    }

    pub async fn state_vector(&self) -> StateVector {
        self.shared.doc.lock().await.state_vector()
    }

    /// Presence of the other clients in the room.
    pub async fn peers(&self) -> Vec<AwarenessChange> {
        self.shared.lock_peers().snapshot()
    }

    /// Connect and start the handshake.
    ///
    /// Spawns a writer task fed by a channel and a reader task that merges
    /// everything the server sends.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.state().await != ConnectionState::Disconnected {
            return Ok(());
        }
        // Left over when the server dropped the previous connection.
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        *self.shared.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), self.room_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Transport(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(256);
        self.writer = Some(tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                let message = match outgoing {
                    Outgoing::Frame(bytes) => WsMessage::Binary(bytes.into()),
                    Outgoing::Close => {
                        let _ = ws_writer.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
        }));

        // Handshake: our state vector, then our presence if we have one
        let sv = self.state_vector().await;
        send(&out_tx, Frame::sync_step1(&sv).encode()).await?;
        let presence = {
            let local = self.shared.local.lock().await;
            local.state.clone().map(|state| AwarenessChange {
                client_id: self.shared.client_id,
                clock: local.clock,
                state: Some(state),
            })
        };
        if let Some(change) = presence {
            send(&out_tx, Frame::awareness(&[change])?.encode()).await?;
        }

        *self.shared.state.write().await = ConnectionState::Handshaking;
        self.shared.emit(SyncEvent::Connected);
        log::info!("Connected to {url}");

        // Reader task: process incoming frames
        let shared = self.shared.clone();
        let replies = out_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(WsMessage::Binary(data)) => handle_frame(&shared, &replies, &data).await,
                    Ok(WsMessage::Close(frame)) => {
                        if let Some(frame) = frame {
                            log::info!(
                                "Server closed the connection: {} {}",
                                u16::from(frame.code),
                                frame.reason.as_str()
                            );
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("WebSocket error: {e}");
                        break;
                    }
                }
            }
            connection_lost(&shared).await;
        }));

        // Renewal task: keep our entry from being swept while idle
        let shared = self.shared.clone();
        let renewals = out_tx.clone();
        let period = self.awareness_renewal;
        self.renewal = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let Some(change) = renew_presence(&shared).await else {
                    continue;
                };
                match Frame::awareness(&[change]) {
                    Ok(frame) => {
                        if send(&renewals, frame.encode()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Could not encode presence renewal: {e}"),
                }
            }
        }));

        self.outgoing_tx = Some(out_tx);
        Ok(())
    }

    /// Replace `range` (in chars) with `text`.
    ///
    /// Applied to the local replica at once; shipped to the server when
    /// connected, otherwise on the next handshake.
    pub async fn edit(&self, range: Range<usize>, text: &str) -> Result<Update, ProtocolError> {
        let (update, changes) = {
            let mut doc = self.shared.doc.lock().await;
            let len = doc.len();
            let start = range.start.min(len);
            let end = range.end.clamp(start, len);
            let update = doc.apply_local_edit(start..end, text);

            let mut changes = Vec::new();
            if end > start {
                changes.push(TextChange::Delete {
                    index: start,
                    len: end - start,
                });
            }
            if !text.is_empty() {
                changes.push(TextChange::Insert {
                    index: start,
                    text: text.to_string(),
                });
            }
            (update, changes)
        };
        if update.is_empty() {
            return Ok(update);
        }
        self.shared.emit(SyncEvent::TextChanged {
            changes,
            origin: ChangeOrigin::Local,
        });

        if let Some(tx) = self.live_sender().await {
            send(tx, Frame::update(&update).encode()).await?;
        }
        Ok(update)
    }

    /// Publish (or with `None`, withdraw) this client's presence.
    pub async fn set_awareness(&self, state: Option<AwarenessState>) -> Result<(), ProtocolError> {
        let change = {
            let mut local = self.shared.local.lock().await;
            local.clock += 1;
            local.state = state.clone();
            AwarenessChange {
                client_id: self.shared.client_id,
                clock: local.clock,
                state,
            }
        };
        if let Some(tx) = self.live_sender().await {
            send(tx, Frame::awareness(&[change])?.encode()).await?;
        }
        Ok(())
    }

    /// Close the connection. The local replica is kept.
    pub async fn disconnect(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Outgoing::Close).await;
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        // No-op when the reader already reported the loss.
        connection_lost(&self.shared).await;
        log::info!("Disconnected from room {}", self.room_id);
    }

    async fn live_sender(&self) -> Option<&mpsc::Sender<Outgoing>> {
        match self.state().await {
            ConnectionState::Handshaking | ConnectionState::Synchronized => {
                self.outgoing_tx.as_ref()
            }
            _ => None,
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
    }
}

async fn send(tx: &mpsc::Sender<Outgoing>, bytes: Vec<u8>) -> Result<(), ProtocolError> {
    tx.send(Outgoing::Frame(bytes))
        .await
        .map_err(|_| ProtocolError::Closed)
}

async fn handle_frame(shared: &Shared, replies: &mpsc::Sender<Outgoing>, bytes: &[u8]) {
    let message = match Frame::decode(bytes).and_then(|frame| frame.message()) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Dropping malformed frame from server: {e}");
            return;
        }
    };

    match message {
        Message::SyncStep1(remote) => {
            let diff = shared.doc.lock().await.diff(&remote);
            let _ = send(replies, Frame::sync_step2(&diff).encode()).await;
        }
        Message::SyncStep2(update) => {
            merge_remote(shared, &update).await;
            let mut state = shared.state.write().await;
            if *state == ConnectionState::Handshaking {
                *state = ConnectionState::Synchronized;
                drop(state);
                log::debug!("Synchronized with server");
                shared.emit(SyncEvent::Synchronized);
            }
        }
        Message::Update(update) => merge_remote(shared, &update).await,
        Message::Awareness(changes) => {
            let others: Vec<AwarenessChange> = changes
                .into_iter()
                .filter(|c| c.client_id != shared.client_id)
                .collect();
            let diff = shared.lock_peers().apply(&others, Instant::now());
            if !diff.is_empty() {
                shared.emit(SyncEvent::Awareness {
                    added: diff.added,
                    updated: diff.updated,
                    removed: diff.removed,
                });
            }
        }
        Message::QueryAwareness => {
            let local = shared.local.lock().await;
            if let Some(state) = local.state.clone() {
                let change = AwarenessChange {
                    client_id: shared.client_id,
                    clock: local.clock,
                    state: Some(state),
                };
                drop(local);
                if let Ok(frame) = Frame::awareness(&[change]) {
                    let _ = send(replies, frame.encode()).await;
                }
            }
        }
    }
}

async fn merge_remote(shared: &Shared, update: &Update) {
    let outcome = shared.doc.lock().await.apply_remote_update(update);
    if !outcome.changes.is_empty() {
        shared.emit(SyncEvent::TextChanged {
            changes: outcome.changes.clone(),
            origin: ChangeOrigin::Remote,
        });
    }
    if outcome.pending > 0 {
        log::debug!("{} remote operations waiting for dependencies", outcome.pending);
    }
}

/// Our presence with a bumped clock, if we publish any.
async fn renew_presence(shared: &Shared) -> Option<AwarenessChange> {
    match *shared.state.read().await {
        ConnectionState::Handshaking | ConnectionState::Synchronized => {}
        _ => return None,
    }
    let mut local = shared.local.lock().await;
    let state = local.state.clone()?;
    local.clock += 1;
    Some(AwarenessChange {
        client_id: shared.client_id,
        clock: local.clock,
        state: Some(state),
    })
}

/// Mark the connection lost and report it once.
///
/// Nothing after taking the state lock awaits, so the report cannot be cut
/// short by aborting the task that runs it.
async fn connection_lost(shared: &Shared) {
    let mut state = shared.state.write().await;
    if *state == ConnectionState::Disconnected {
        return;
    }
    *state = ConnectionState::Disconnected;

    // Remote presence is only valid while connected.
    let removed: Vec<u64> = {
        let mut peers = shared.lock_peers();
        let ids: Vec<u64> = peers.snapshot().iter().map(|c| c.client_id).collect();
        for id in &ids {
            peers.remove(*id);
        }
        ids
    };
    if !removed.is_empty() {
        shared.emit(SyncEvent::Awareness {
            added: Vec::new(),
            updated: Vec::new(),
            removed,
        });
    }
    shared.emit(SyncEvent::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_starts_disconnected() {
        let mut client = SyncClient::with_replica("ws://127.0.0.1:1", "room", 9);
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert_eq!(client.client_id(), 9);
        assert_eq!(client.room_id(), "room");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_offline_edits_stay_local() {
        let mut client = SyncClient::with_replica("ws://127.0.0.1:1", "room", 1);
        let mut events = client.take_event_rx().unwrap();

        client.edit(0..0, "draft").await.unwrap();
        client.edit(5..5, "!").await.unwrap();
        client.edit(0..1, "D").await.unwrap();
        assert_eq!(client.text().await, "Draft!");
        assert_eq!(client.state_vector().await.get(1), 8);

        match events.recv().await.unwrap() {
            SyncEvent::TextChanged { changes, origin } => {
                assert_eq!(origin, ChangeOrigin::Local);
                assert_eq!(
                    changes,
                    vec![TextChange::Insert {
                        index: 0,
                        text: "draft".into()
                    }]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_edit_range_is_clamped() {
        let client = SyncClient::with_replica("ws://127.0.0.1:1", "room", 1);
        client.edit(0..0, "abc").await.unwrap();
        client.edit(2..99, "").await.unwrap();
        assert_eq!(client.text().await, "ab");
        let noop = client.edit(10..12, "").await.unwrap();
        assert!(noop.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        // Port 1 is reserved and refuses connections.
        let mut client = SyncClient::with_replica("ws://127.0.0.1:1", "room", 1);
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(_)));
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connection_loss_reported_once() {
        let mut client = SyncClient::with_replica("ws://127.0.0.1:1", "room", 2);
        let mut events = client.take_event_rx().unwrap();
        *client.shared.state.write().await = ConnectionState::Synchronized;
        client.shared.lock_peers().set(7, 1, AwarenessState::default());

        connection_lost(&client.shared).await;
        connection_lost(&client.shared).await;
        client.disconnect().await;

        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::Awareness {
                added: Vec::new(),
                updated: Vec::new(),
                removed: vec![7],
            }
        );
        assert_eq!(events.recv().await.unwrap(), SyncEvent::Disconnected);
        assert!(events.try_recv().is_err());
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_presence_renewal_bumps_clock_only_when_live() {
        let client = SyncClient::with_replica("ws://127.0.0.1:1", "room", 3)
            .with_awareness_renewal(Duration::ZERO);
        assert_eq!(client.awareness_renewal, Duration::from_millis(1));

        client
            .set_awareness(Some(AwarenessState::default()))
            .await
            .unwrap();
        assert!(renew_presence(&client.shared).await.is_none());

        *client.shared.state.write().await = ConnectionState::Synchronized;
        let renewed = renew_presence(&client.shared).await.unwrap();
        assert_eq!(renewed.client_id, 3);
        assert_eq!(renewed.clock, 2);
        assert_eq!(renewed.state, Some(AwarenessState::default()));

        client.set_awareness(None).await.unwrap();
        assert!(renew_presence(&client.shared).await.is_none());
    }

    #[tokio::test]
    async fn test_awareness_set_while_offline() {
        let client = SyncClient::with_replica("ws://127.0.0.1:1", "room", 4);
        client
            .set_awareness(Some(AwarenessState::default()))
            .await
            .unwrap();
        client.set_awareness(None).await.unwrap();
        let local = client.shared.local.lock().await;
        assert_eq!(local.clock, 2);
        assert!(local.state.is_none());
    }
}
