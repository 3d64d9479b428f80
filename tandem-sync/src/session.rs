//! Per-connection synchronization state machine.
//!
//! ```text
//! Connecting ──open()──► SyncHandshake ──SyncStep2──► Synchronized
//!                              │                           │
//!                              └────────close()────────────┴──► Closing ──► Closed
//! ```
//!
//! A session consumes raw frames and returns the frames to send back to its
//! own peer. Frames for the rest of the room go through the room's
//! [`BroadcastGroup`](crate::broadcast::BroadcastGroup), tagged with the
//! session id so the transport can skip echoing them to their origin.

use std::collections::HashSet;
use std::sync::Arc;

use crate::awareness::AwarenessChange;
use crate::broadcast::{Relay, SessionId};
use crate::protocol::{Frame, MessageKind, ProtocolError};
use crate::room::{Room, RoomManager};
use crate::update::{StateVector, Update};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    SyncHandshake,
    Synchronized,
    Closing,
    Closed,
}

/// Protocol state of one connection to one room.
pub struct SyncSession {
    id: SessionId,
    room: Arc<Room>,
    state: SessionState,
    /// Awareness client ids announced over this connection.
    clients: HashSet<u64>,
}

impl SyncSession {
    /// `room` must already have been joined through the [`RoomManager`].
    pub fn new(id: SessionId, room: Arc<Room>) -> Self {
        Self {
            id,
            room,
            state: SessionState::Connecting,
            clients: HashSet::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn room_id(&self) -> &str {
        self.room.id()
    }

    pub fn announced_clients(&self) -> &HashSet<u64> {
        &self.clients
    }

    /// Frames that open the handshake: the server's state vector and, when
    /// anyone is present, the awareness snapshot.
    pub async fn open(&mut self) -> Result<Vec<Frame>, ProtocolError> {
        if self.state != SessionState::Connecting {
            return Ok(Vec::new());
        }
        let mut frames = vec![Frame::sync_step1(&self.room.state_vector().await)];
        let snapshot = self.room.awareness_snapshot().await;
        if !snapshot.is_empty() {
            frames.push(Frame::awareness(&snapshot)?);
        }
        self.state = SessionState::SyncHandshake;
        log::debug!("Session {} opened on room {}", self.id, self.room.id());
        Ok(frames)
    }

    /// Handle one inbound frame. Returns the replies for this peer.
    ///
    /// A [`ProtocolError::Decode`] leaves the session usable unless
    /// [`ProtocolError::is_fatal`] says otherwise.
    pub async fn receive(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return Err(ProtocolError::Closed);
        }
        let frame = Frame::decode(bytes)?;

        match frame.kind {
            MessageKind::SyncStep1 => {
                let remote = StateVector::decode(&frame.payload)?;
                let diff = self.room.diff(&remote).await;
                log::trace!("Session {}: sending {} ops in SyncStep2", self.id, diff.len());
                Ok(vec![Frame::sync_step2(&diff)])
            }
            MessageKind::SyncStep2 => {
                let update = Update::decode(&frame.payload)?;
                if self.integrate(&update).await {
                    let relay = Frame::new(MessageKind::Update, frame.payload);
                    self.room.broadcast().broadcast(self.id, &relay);
                }
                if self.state == SessionState::SyncHandshake {
                    self.state = SessionState::Synchronized;
                    log::debug!("Session {} synchronized", self.id);
                }
                Ok(Vec::new())
            }
            MessageKind::Update => {
                let update = Update::decode(&frame.payload)?;
                if self.integrate(&update).await {
                    self.room
                        .broadcast()
                        .broadcast_raw(self.id, Arc::new(bytes.to_vec()));
                }
                Ok(Vec::new())
            }
            MessageKind::AwarenessUpdate => {
                let changes = AwarenessChange::decode_all(&frame.payload)?;
                for change in &changes {
                    if change.is_removal() {
                        self.clients.remove(&change.client_id);
                    } else {
                        self.clients.insert(change.client_id);
                    }
                }
                let diff = self.room.apply_awareness(&changes).await;
                if !diff.is_empty() {
                    self.room
                        .broadcast()
                        .broadcast_raw(self.id, Arc::new(bytes.to_vec()));
                }
                Ok(Vec::new())
            }
            MessageKind::QueryAwareness => {
                let snapshot = self.room.awareness_snapshot().await;
                Ok(vec![Frame::awareness(&snapshot)?])
            }
        }
    }

    /// Whether a relayed frame should be forwarded to this session's peer.
    pub fn accepts(&self, relay: &Relay) -> bool {
        relay.is_for(self.id) && !matches!(self.state, SessionState::Closing | SessionState::Closed)
    }

    /// The whole document as one `Update`, for a peer that missed relays.
    pub async fn resync_frame(&self) -> Frame {
        Frame::update(&self.room.state_update().await)
    }

    /// Withdraw this connection's awareness entries and leave the room.
    pub async fn close(&mut self, rooms: &RoomManager) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closing;

        let removed = self.room.remove_awareness(self.id, &self.clients).await;
        if !removed.is_empty() {
            log::debug!(
                "Session {}: withdrew {} awareness entries",
                self.id,
                removed.len()
            );
        }
        self.clients.clear();

        rooms.leave(self.room.id(), self.id).await;
        self.state = SessionState::Closed;
        log::debug!("Session {} closed", self.id);
    }

    async fn integrate(&self, update: &Update) -> bool {
        let outcome = self.room.apply_update(update).await;
        log::trace!(
            "Session {}: {} new, {} integrated, {} duplicate, {} pending",
            self.id,
            outcome.received,
            outcome.integrated,
            outcome.duplicates,
            outcome.pending
        );
        if outcome.rejected > 0 {
            log::warn!(
                "Session {}: dropped {} operations with invalid anchors",
                self.id,
                outcome.rejected
            );
        }
        outcome.has_new_ops()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::{AwarenessState, UserInfo};
    use crate::crdt::Document;
    use crate::protocol::Message;
    use crate::room::RoomConfig;
    use crate::storage::MemoryStore;
    use crate::update::DecodeError;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;
    use uuid::Uuid;

    async fn setup() -> (RoomManager, SyncSession) {
        let config = RoomConfig {
            save_debounce: Duration::from_secs(60),
            save_max_debounce: Duration::from_secs(60),
            ..RoomConfig::default()
        };
        let manager = RoomManager::new(Arc::new(MemoryStore::new()), config);
        let id = Uuid::new_v4();
        let room = manager.join("room", id).await;
        (manager, SyncSession::new(id, room))
    }

    fn presence(client_id: u64, clock: u64, name: &str) -> AwarenessChange {
        AwarenessChange {
            client_id,
            clock,
            state: Some(AwarenessState {
                user: Some(UserInfo {
                    name: name.into(),
                    color: "#6eeb83".into(),
                }),
                cursor: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_open_sends_state_vector() {
        let (_manager, mut session) = setup().await;
        let frames = session.open().await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, MessageKind::SyncStep1);
        assert_eq!(session.state(), SessionState::SyncHandshake);
        assert!(session.open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_includes_awareness_snapshot() {
        let (_manager, mut session) = setup().await;
        session.room().apply_awareness(&[presence(3, 1, "Ada")]).await;
        let frames = session.open().await.unwrap();
        assert_eq!(frames.len(), 2);
        match frames[1].message().unwrap() {
            Message::Awareness(changes) => assert_eq!(changes[0].client_id, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_exchanges_missing_state() {
        let (_manager, mut session) = setup().await;
        session.room().apply_local_edit(0..0, "server side").await;
        session.open().await.unwrap();

        let mut client = Document::new(42);
        let request = Frame::sync_step1(&client.state_vector()).encode();
        let replies = session.receive(&request).await.unwrap();
        assert_eq!(replies.len(), 1);
        match replies[0].message().unwrap() {
            Message::SyncStep2(diff) => {
                client.apply_remote_update(&diff);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.text(), "server side");

        let mut rx = session.room().broadcast().subscribe();
        let len = client.len();
        let local = client.apply_local_edit(len..len, "!");
        let step2 = Frame::sync_step2(&local).encode();
        session.receive(&step2).await.unwrap();
        assert_eq!(session.state(), SessionState::Synchronized);
        assert_eq!(session.room().text().await, "server side!");

        let relay = rx.recv().await.unwrap();
        assert_eq!(relay.origin, session.id());
        assert!(!session.accepts(&relay));
        let relayed = Frame::decode(&relay.bytes).unwrap();
        assert_eq!(relayed.kind, MessageKind::Update);
        assert_eq!(relayed.message().unwrap(), Message::Update(local));
    }

    #[tokio::test]
    async fn test_update_relayed_verbatim_once() {
        let (_manager, mut session) = setup().await;
        session.open().await.unwrap();
        let mut rx = session.room().broadcast().subscribe();

        let bytes = Frame::update(&Document::new(8).apply_local_edit(0..0, "hey")).encode();
        session.receive(&bytes).await.unwrap();
        session.receive(&bytes).await.unwrap();

        let relay = rx.recv().await.unwrap();
        assert_eq!(relay.bytes.as_slice(), bytes.as_slice());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(session.room().text().await, "hey");
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_session() {
        let (_manager, mut session) = setup().await;
        session.open().await.unwrap();

        let err = session.receive(&[MessageKind::Update as u8, 3, 1]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(DecodeError::TruncatedMessage)));
        assert!(!err.is_fatal());
        assert_eq!(session.state(), SessionState::SyncHandshake);

        let ok = Frame::update(&Document::new(1).apply_local_edit(0..0, "fine")).encode();
        session.receive(&ok).await.unwrap();
        assert_eq!(session.room().text().await, "fine");
    }

    #[tokio::test]
    async fn test_unsupported_version_is_fatal() {
        let (_manager, mut session) = setup().await;
        session.open().await.unwrap();
        let frame = Frame::new(MessageKind::Update, vec![9, 0]).encode();
        let err = session.receive(&frame).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_awareness_relay_and_removal_on_close() {
        let (manager, mut session) = setup().await;
        session.open().await.unwrap();
        let other = Uuid::new_v4();
        manager.join("room", other).await;
        let mut rx = session.room().broadcast().subscribe();

        let bytes = Frame::awareness(&[presence(77, 1, "Grace")]).unwrap().encode();
        session.receive(&bytes).await.unwrap();
        assert!(session.announced_clients().contains(&77));
        let relay = rx.recv().await.unwrap();
        assert_eq!(relay.bytes.as_slice(), bytes.as_slice());

        let room = session.room().clone();
        session.close(&manager).await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(room.awareness_snapshot().await.is_empty());

        let relay = rx.recv().await.unwrap();
        match Frame::decode(&relay.bytes).unwrap().message().unwrap() {
            Message::Awareness(changes) => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].client_id, 77);
                assert!(changes[0].is_removal());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(manager.session_count("room").await, 1);
    }

    #[tokio::test]
    async fn test_query_awareness_returns_snapshot() {
        let (_manager, mut session) = setup().await;
        session.open().await.unwrap();
        session.room().apply_awareness(&[presence(5, 2, "Lin")]).await;
        let replies = session
            .receive(&Frame::query_awareness().encode())
            .await
            .unwrap();
        match replies[0].message().unwrap() {
            Message::Awareness(changes) => {
                assert_eq!(changes, vec![presence(5, 2, "Lin")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_receive_after_close_fails() {
        let (manager, mut session) = setup().await;
        session.open().await.unwrap();
        session.close(&manager).await;
        let err = session
            .receive(&Frame::query_awareness().encode())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Closed));
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_resync_frame_carries_full_state() {
        let (_manager, session) = setup().await;
        session.room().apply_local_edit(0..0, "everything").await;
        let frame = session.resync_frame().await;
        let mut fresh = Document::new(3);
        match frame.message().unwrap() {
            Message::Update(update) => {
                fresh.apply_remote_update(&update);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fresh.text(), "everything");
    }
}
