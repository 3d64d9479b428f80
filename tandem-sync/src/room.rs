//! Room lifecycle: one live [`Document`] per room id.
//!
//! ```text
//! join(room, session)                       leave(room, session)
//!   │                                          │
//!   ▼                                          ▼
//! slot map ──► RoomSlot (async mutex) ◄──── last session?
//!   │            Vacant ─load─► Live ─flush─► Retired
//!   ▼
//! Arc<Room> ── doc / awareness / broadcast / save schedule
//! ```
//!
//! Every room id maps to a slot whose mutex serializes load-then-join and
//! flush-then-evict. A retired slot is never reused: a joiner that finds one
//! retries against a fresh slot, so at most one `Document` exists per room.
//!
//! Mutations arm a debounced save: each one re-arms a timer of
//! `save_debounce`, bounded by `save_max_debounce` from the first unsaved
//! mutation. Saves of one room are serialized by `persist_lock`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::awareness::{AwarenessChange, AwarenessDiff, AwarenessStore};
use crate::broadcast::{BroadcastGroup, SessionId};
use crate::crdt::{ApplyOutcome, Document};
use crate::protocol::Frame;
use crate::storage::{PersistenceError, PersistenceGateway};
use crate::update::{StateVector, Update};

/// Per-room tuning.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Quiet period after the last mutation before saving.
    pub save_debounce: Duration,
    /// Upper bound between the first unsaved mutation and its save.
    pub save_max_debounce: Duration,
    /// Frames buffered per session before it lags.
    pub broadcast_capacity: usize,
    /// Silence after which an awareness entry is dropped.
    pub awareness_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(2_000),
            save_max_debounce: Duration::from_millis(10_000),
            broadcast_capacity: 256,
            awareness_timeout: Duration::from_millis(30_000),
        }
    }
}

#[derive(Default)]
struct SaveSchedule {
    /// Bumped on every mutation.
    version: u64,
    /// Highest version known to be stored.
    saved_version: u64,
    first_unsaved: Option<Instant>,
    last_persist: Option<Instant>,
    saves: u64,
    timer: Option<JoinHandle<()>>,
}

/// A live room.
pub struct Room {
    id: String,
    doc: Mutex<Document>,
    awareness: Mutex<AwarenessStore>,
    broadcast: BroadcastGroup,
    schedule: StdMutex<SaveSchedule>,
    persist_lock: Mutex<()>,
    /// Set when the initial load failed; stored state is merged in before
    /// the first save so it is never overwritten.
    needs_reload: AtomicBool,
    gateway: Arc<dyn PersistenceGateway>,
    config: RoomConfig,
}

impl Room {
    fn new(
        id: &str,
        doc: Document,
        gateway: Arc<dyn PersistenceGateway>,
        config: RoomConfig,
        needs_reload: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            doc: Mutex::new(doc),
            awareness: Mutex::new(AwarenessStore::new()),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            schedule: StdMutex::new(SaveSchedule::default()),
            persist_lock: Mutex::new(()),
            needs_reload: AtomicBool::new(needs_reload),
            gateway,
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    // ─── Document ─────────────────────────────────────────────────────

    pub async fn text(&self) -> String {
        self.doc.lock().await.text()
    }

    pub async fn state_vector(&self) -> StateVector {
        self.doc.lock().await.state_vector()
    }

    pub async fn diff(&self, remote: &StateVector) -> Update {
        self.doc.lock().await.diff(remote)
    }

    /// Every operation of the document.
    pub async fn state_update(&self) -> Update {
        self.doc.lock().await.state_update()
    }

    /// Merge a client update; arms the save timer when anything was new.
    pub async fn apply_update(self: &Arc<Self>, update: &Update) -> ApplyOutcome {
        let mut doc = self.doc.lock().await;
        let outcome = doc.apply_remote_update(update);
        if outcome.has_new_ops() {
            self.mark_dirty();
        }
        outcome
    }

    /// Edit the document as the server replica, without relaying the edit.
    #[cfg(test)]
    pub(crate) async fn apply_local_edit(
        self: &Arc<Self>,
        range: std::ops::Range<usize>,
        text: &str,
    ) -> Update {
        let mut doc = self.doc.lock().await;
        let update = doc.apply_local_edit(range, text);
        if !update.is_empty() {
            self.mark_dirty();
        }
        update
    }

    // ─── Awareness ────────────────────────────────────────────────────

    pub async fn apply_awareness(&self, changes: &[AwarenessChange]) -> AwarenessDiff {
        self.awareness.lock().await.apply(changes, Instant::now())
    }

    pub async fn awareness_snapshot(&self) -> Vec<AwarenessChange> {
        self.awareness.lock().await.snapshot()
    }

    /// Drop the given clients and tell everyone but `origin`.
    pub async fn remove_awareness(
        &self,
        origin: SessionId,
        client_ids: &HashSet<u64>,
    ) -> Vec<AwarenessChange> {
        let removed: Vec<AwarenessChange> = {
            let mut store = self.awareness.lock().await;
            client_ids.iter().filter_map(|id| store.remove(*id)).collect()
        };
        if !removed.is_empty() {
            self.announce_awareness(origin, &removed);
        }
        removed
    }

    /// Expire silent awareness entries. Returns the number removed.
    pub async fn sweep_awareness(&self, now: Instant) -> usize {
        let removed = self
            .awareness
            .lock()
            .await
            .sweep(now, self.config.awareness_timeout);
        if !removed.is_empty() {
            log::debug!("Room {}: expired {} awareness entries", self.id, removed.len());
            self.announce_awareness(Uuid::nil(), &removed);
        }
        removed.len()
    }

    fn announce_awareness(&self, origin: SessionId, changes: &[AwarenessChange]) {
        match Frame::awareness(changes) {
            Ok(frame) => {
                self.broadcast.broadcast(origin, &frame);
            }
            Err(e) => log::error!("Room {}: failed to encode awareness removal: {e}", self.id),
        }
    }

    // ─── Persistence ──────────────────────────────────────────────────

    pub fn is_dirty(&self) -> bool {
        let schedule = self.lock_schedule();
        schedule.version != schedule.saved_version
    }

    pub fn last_persisted(&self) -> Option<Instant> {
        self.lock_schedule().last_persist
    }

    /// Successful saves since the room went live.
    pub fn save_count(&self) -> u64 {
        self.lock_schedule().saves
    }

    /// Save the current state if it changed since the last save.
    ///
    /// Returns `Ok(true)` when a save happened. On failure the save timer is
    /// re-armed and the in-memory document is left untouched.
    pub async fn flush(self: &Arc<Self>) -> Result<bool, PersistenceError> {
        let _persist = self.persist_lock.lock().await;
        if !self.is_dirty() {
            return Ok(false);
        }

        if self.needs_reload.load(Ordering::Acquire) {
            if let Err(e) = self.reload_stored_state().await {
                log::warn!("Room {}: stored state still unreadable, save postponed: {e}", self.id);
                self.retry_later();
                return Err(e);
            }
        }

        let (version, state) = {
            let doc = self.doc.lock().await;
            let version = self.lock_schedule().version;
            (version, doc.encode_state())
        };

        match self.gateway.save(&self.id, state).await {
            Ok(()) => {
                let mut schedule = self.lock_schedule();
                schedule.saved_version = schedule.saved_version.max(version);
                schedule.last_persist = Some(Instant::now());
                schedule.saves += 1;
                // Mutations that landed during the save start a new window.
                schedule.first_unsaved =
                    (schedule.saved_version != schedule.version).then(Instant::now);
                log::debug!("Room {}: saved version {version}", self.id);
                Ok(true)
            }
            Err(e) => {
                log::warn!(
                    "Room {}: save failed, retrying in {:?}: {e}",
                    self.id,
                    self.config.save_debounce
                );
                self.retry_later();
                Err(e)
            }
        }
    }

    /// Merge what the store holds into the live document.
    async fn reload_stored_state(&self) -> Result<(), PersistenceError> {
        if let Some(bytes) = self.gateway.load(&self.id).await? {
            match Update::decode(&bytes) {
                Ok(update) => {
                    let outcome = self.doc.lock().await.apply_remote_update(&update);
                    if outcome.has_new_ops() {
                        self.broadcast.broadcast(Uuid::nil(), &Frame::update(&update));
                    }
                    log::info!(
                        "Room {}: merged {} stored operations",
                        self.id,
                        outcome.integrated
                    );
                }
                Err(e) => log::error!("Room {}: stored state is corrupt, replacing it: {e}", self.id),
            }
        }
        self.needs_reload.store(false, Ordering::Release);
        Ok(())
    }

    fn mark_dirty(self: &Arc<Self>) {
        let mut schedule = self.lock_schedule();
        schedule.version += 1;
        let now = Instant::now();
        let first = *schedule.first_unsaved.get_or_insert(now);
        let remaining = self
            .config
            .save_max_debounce
            .saturating_sub(now.saturating_duration_since(first));
        let delay = self.config.save_debounce.min(remaining);
        self.arm_timer(&mut schedule, delay);
    }

    fn retry_later(self: &Arc<Self>) {
        let mut schedule = self.lock_schedule();
        self.arm_timer(&mut schedule, self.config.save_debounce);
    }

    fn arm_timer(self: &Arc<Self>, schedule: &mut SaveSchedule, delay: Duration) {
        if let Some(timer) = schedule.timer.take() {
            timer.abort();
        }
        let room = Arc::downgrade(self);
        schedule.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(room) = room.upgrade() {
                // The save runs in its own task: aborting this timer must not
                // cancel it.
                tokio::spawn(async move {
                    let _ = room.flush().await;
                });
            }
        }));
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.lock_schedule().timer.take() {
            timer.abort();
        }
    }

    fn lock_schedule(&self) -> MutexGuard<'_, SaveSchedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        let schedule = self.schedule.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = schedule.timer.take() {
            timer.abort();
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Room manager
// ───────────────────────────────────────────────────────────────────

enum SlotState {
    Vacant,
    Live {
        room: Arc<Room>,
        sessions: HashSet<SessionId>,
    },
    Retired,
}

struct RoomSlot {
    state: Mutex<SlotState>,
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub awareness_expired: usize,
    pub rooms_evicted: usize,
}

struct ManagerInner {
    slots: Mutex<HashMap<String, Arc<RoomSlot>>>,
    gateway: Arc<dyn PersistenceGateway>,
    config: RoomConfig,
}

/// Owns every live room. Cheap to clone.
#[derive(Clone)]
pub struct RoomManager {
    inner: Arc<ManagerInner>,
}

impl RoomManager {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, config: RoomConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                slots: Mutex::new(HashMap::new()),
                gateway,
                config,
            }),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.inner.config
    }

    /// Register `session` in the room, loading the room on first use.
    pub async fn join(&self, room_id: &str, session: SessionId) -> Arc<Room> {
        loop {
            let slot = {
                let mut slots = self.inner.slots.lock().await;
                slots
                    .entry(room_id.to_string())
                    .or_insert_with(|| {
                        Arc::new(RoomSlot {
                            state: Mutex::new(SlotState::Vacant),
                        })
                    })
                    .clone()
            };

            let mut state = slot.state.lock().await;
            match &mut *state {
                SlotState::Retired => continue,
                SlotState::Live { room, sessions } => {
                    sessions.insert(session);
                    log::debug!("Session {session} joined room {room_id} ({} sessions)", sessions.len());
                    return room.clone();
                }
                SlotState::Vacant => {
                    let room = self.load_room(room_id).await;
                    *state = SlotState::Live {
                        room: room.clone(),
                        sessions: HashSet::from([session]),
                    };
                    log::info!("Room {room_id} is live");
                    return room;
                }
            }
        }
    }

    /// Unregister `session`; flush and evict the room if it was the last one.
    pub async fn leave(&self, room_id: &str, session: SessionId) {
        let Some(slot) = self.slot(room_id).await else {
            return;
        };
        let mut state = slot.state.lock().await;
        let room = match &mut *state {
            SlotState::Live { room, sessions } => {
                sessions.remove(&session);
                log::debug!("Session {session} left room {room_id} ({} sessions)", sessions.len());
                if !sessions.is_empty() {
                    return;
                }
                room.clone()
            }
            _ => return,
        };
        self.try_evict(&slot, &mut state, room_id, &room).await;
    }

    /// Live room, if any.
    pub async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        let slot = self.slot(room_id).await?;
        let state = slot.state.lock().await;
        match &*state {
            SlotState::Live { room, .. } => Some(room.clone()),
            _ => None,
        }
    }

    /// Sessions registered in a room.
    pub async fn session_count(&self, room_id: &str) -> usize {
        let Some(slot) = self.slot(room_id).await else {
            return 0;
        };
        let state = slot.state.lock().await;
        match &*state {
            SlotState::Live { sessions, .. } => sessions.len(),
            _ => 0,
        }
    }

    /// Ids of live rooms, sorted.
    pub async fn active_rooms(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for (id, slot) in self.slots().await {
            if matches!(&*slot.state.lock().await, SlotState::Live { .. }) {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    pub async fn room_count(&self) -> usize {
        self.active_rooms().await.len()
    }

    /// Expire awareness entries and retry eviction of idle rooms whose final
    /// save failed earlier.
    pub async fn maintain(&self, now: Instant) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        for (id, slot) in self.slots().await {
            let mut state = slot.state.lock().await;
            let (room, idle) = match &*state {
                SlotState::Live { room, sessions } => (room.clone(), sessions.is_empty()),
                _ => continue,
            };
            report.awareness_expired += room.sweep_awareness(now).await;
            if idle && self.try_evict(&slot, &mut state, &id, &room).await {
                report.rooms_evicted += 1;
            }
        }
        report
    }

    /// Save every dirty room now. Returns the number of rooms saved.
    pub async fn flush_all(&self) -> usize {
        let mut saved = 0;
        for (id, slot) in self.slots().await {
            let room = match &*slot.state.lock().await {
                SlotState::Live { room, .. } => room.clone(),
                _ => continue,
            };
            room.cancel_timer();
            match room.flush().await {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => log::error!("Room {id}: flush failed: {e}"),
            }
        }
        saved
    }

    /// Final save then eviction. Keeps the room live when the save fails.
    async fn try_evict(
        &self,
        slot: &Arc<RoomSlot>,
        state: &mut SlotState,
        room_id: &str,
        room: &Arc<Room>,
    ) -> bool {
        room.cancel_timer();
        if let Err(e) = room.flush().await {
            log::error!("Room {room_id}: final save failed, keeping it in memory: {e}");
            return false;
        }

        *state = SlotState::Retired;
        let mut slots = self.inner.slots.lock().await;
        if slots.get(room_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(room_id);
        }
        log::info!("Room {room_id} evicted");
        true
    }

    async fn load_room(&self, room_id: &str) -> Arc<Room> {
        let replica = Uuid::new_v4().as_u64_pair().0;
        let config = self.inner.config.clone();
        let gateway = self.inner.gateway.clone();

        match gateway.load(room_id).await {
            Ok(Some(bytes)) => match Document::from_state(replica, &bytes) {
                Ok(doc) => {
                    log::info!(
                        "Room {room_id}: loaded {} bytes ({} operations)",
                        bytes.len(),
                        doc.operation_count()
                    );
                    Room::new(room_id, doc, gateway, config, false)
                }
                Err(e) => {
                    log::error!("Room {room_id}: stored state is corrupt, starting empty: {e}");
                    Room::new(room_id, Document::new(replica), gateway, config, false)
                }
            },
            Ok(None) => Room::new(room_id, Document::new(replica), gateway, config, false),
            Err(e) => {
                log::error!("Room {room_id}: load failed, starting empty: {e}");
                Room::new(room_id, Document::new(replica), gateway, config, true)
            }
        }
    }

    async fn slot(&self, room_id: &str) -> Option<Arc<RoomSlot>> {
        self.inner.slots.lock().await.get(room_id).cloned()
    }

    async fn slots(&self) -> Vec<(String, Arc<RoomSlot>)> {
        self.inner
            .slots
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Memory store whose next loads/saves can be made to fail.
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryStore,
        failing_loads: AtomicUsize,
        failing_saves: AtomicUsize,
    }

    impl ScriptedStore {
        fn fail_loads(&self, n: usize) {
            self.failing_loads.store(n, Ordering::SeqCst);
        }

        fn fail_saves(&self, n: usize) {
            self.failing_saves.store(n, Ordering::SeqCst);
        }

        fn take_failure(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl PersistenceGateway for ScriptedStore {
        async fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
            if Self::take_failure(&self.failing_loads) {
                return Err(PersistenceError::Unavailable("scripted load failure".into()));
            }
            self.inner.load(room_id).await
        }

        async fn save(&self, room_id: &str, state: Vec<u8>) -> Result<(), PersistenceError> {
            if Self::take_failure(&self.failing_saves) {
                return Err(PersistenceError::Unavailable("scripted save failure".into()));
            }
            self.inner.save(room_id, state).await
        }
    }

    fn quick_config() -> RoomConfig {
        RoomConfig {
            save_debounce: Duration::from_millis(50),
            save_max_debounce: Duration::from_millis(200),
            broadcast_capacity: 16,
            awareness_timeout: Duration::from_millis(100),
        }
    }

    fn slow_config() -> RoomConfig {
        RoomConfig {
            save_debounce: Duration::from_secs(60),
            save_max_debounce: Duration::from_secs(120),
            ..quick_config()
        }
    }

    fn update_with(replica: u64, text: &str) -> Update {
        Document::new(replica).apply_local_edit(0..0, text)
    }

    #[tokio::test]
    async fn test_join_loads_stored_state() {
        let store = Arc::new(MemoryStore::new());
        let mut doc = Document::new(1);
        doc.apply_local_edit(0..0, "stored text");
        store.insert("r", doc.encode_state());

        let manager = RoomManager::new(store.clone(), slow_config());
        let room = manager.join("r", Uuid::new_v4()).await;
        assert_eq!(room.text().await, "stored text");
        assert!(!room.is_dirty());
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_joiners_share_one_document() {
        let manager = RoomManager::new(Arc::new(MemoryStore::new()), slow_config());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.join("shared", Uuid::new_v4()).await
            }));
        }
        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.unwrap());
        }
        assert!(rooms.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(manager.session_count("shared").await, 16);
    }

    #[tokio::test]
    async fn test_last_leave_saves_once_and_evicts() {
        let store = Arc::new(MemoryStore::new());
        let manager = RoomManager::new(store.clone(), slow_config());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let room = manager.join("doc", a).await;
        manager.join("doc", b).await;
        room.apply_update(&update_with(7, "unsaved")).await;
        assert!(room.is_dirty());

        manager.leave("doc", a).await;
        assert_eq!(store.save_count(), 0);
        assert_eq!(manager.room_count().await, 1);

        manager.leave("doc", b).await;
        assert_eq!(store.save_count(), 1);
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.room("doc").await.is_none());

        let saved = Document::from_state(1, &store.get("doc").unwrap()).unwrap();
        assert_eq!(saved.text(), "unsaved");
    }

    #[tokio::test]
    async fn test_clean_room_evicts_without_saving() {
        let store = Arc::new(MemoryStore::new());
        let manager = RoomManager::new(store.clone(), slow_config());
        let s = Uuid::new_v4();
        manager.join("quiet", s).await;
        manager.leave("quiet", s).await;
        assert_eq!(store.save_count(), 0);
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejoin_after_eviction_sees_saved_state() {
        let store = Arc::new(MemoryStore::new());
        let manager = RoomManager::new(store.clone(), slow_config());
        let s = Uuid::new_v4();
        let first = manager.join("again", s).await;
        first.apply_update(&update_with(3, "round trip")).await;
        manager.leave("again", s).await;

        let second = manager.join("again", Uuid::new_v4()).await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.text().await, "round trip");
    }

    #[tokio::test]
    async fn test_debounce_coalesces_bursts() {
        let store = Arc::new(MemoryStore::new());
        let manager = RoomManager::new(store.clone(), quick_config());
        let room = manager.join("burst", Uuid::new_v4()).await;

        let mut doc = Document::new(5);
        for i in 0..5 {
            let len = doc.len();
            room.apply_update(&doc.apply_local_edit(len..len, &i.to_string()))
                .await;
        }
        assert_eq!(store.save_count(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.save_count(), 1);
        assert!(!room.is_dirty());
        assert!(room.last_persisted().is_some());
    }

    #[tokio::test]
    async fn test_max_debounce_bounds_delay() {
        let store = Arc::new(MemoryStore::new());
        let config = RoomConfig {
            save_debounce: Duration::from_millis(150),
            save_max_debounce: Duration::from_millis(300),
            ..quick_config()
        };
        let manager = RoomManager::new(store.clone(), config);
        let room = manager.join("steady", Uuid::new_v4()).await;

        // Keep editing faster than the debounce for well past the bound.
        let mut doc = Document::new(5);
        for _ in 0..16 {
            let len = doc.len();
            room.apply_update(&doc.apply_local_edit(len..len, "x")).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(store.save_count() >= 1, "no save while edits kept coming");
    }

    #[tokio::test]
    async fn test_failed_final_save_keeps_room_until_flushed() {
        let store = Arc::new(ScriptedStore::default());
        let manager = RoomManager::new(store.clone(), quick_config());
        let s = Uuid::new_v4();
        let room = manager.join("flaky", s).await;
        room.apply_update(&update_with(2, "precious")).await;

        store.fail_saves(usize::MAX);
        manager.leave("flaky", s).await;
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(room.text().await, "precious");
        assert!(room.is_dirty());

        store.fail_saves(0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!room.is_dirty());

        let report = manager.maintain(Instant::now()).await;
        assert_eq!(report.rooms_evicted, 1);
        assert_eq!(manager.room_count().await, 0);
        assert_eq!(store.inner.save_count(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_starts_empty_and_merges_before_saving() {
        let store = Arc::new(ScriptedStore::default());
        let mut original = Document::new(1);
        original.apply_local_edit(0..0, "stored");
        store.inner.insert("fragile", original.encode_state());

        store.fail_loads(1);
        let manager = RoomManager::new(store.clone(), slow_config());
        let s = Uuid::new_v4();
        let room = manager.join("fragile", s).await;
        assert_eq!(room.text().await, "");
        assert!(!room.is_dirty());

        let mut client = Document::new(2);
        client.apply_local_edit(0..0, "new ");
        room.apply_update(&client.state_update()).await;

        assert!(room.flush().await.unwrap());
        let text = room.text().await;
        assert!(text.contains("stored") && text.contains("new "), "{text}");

        let saved = Document::from_state(9, &store.inner.get("fragile").unwrap()).unwrap();
        assert_eq!(saved.text(), text);
    }

    #[tokio::test]
    async fn test_leave_unknown_room_is_noop() {
        let manager = RoomManager::new(Arc::new(MemoryStore::new()), slow_config());
        manager.leave("ghost", Uuid::new_v4()).await;
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_flush_all_saves_dirty_rooms() {
        let store = Arc::new(MemoryStore::new());
        let manager = RoomManager::new(store.clone(), slow_config());
        let one = manager.join("one", Uuid::new_v4()).await;
        manager.join("two", Uuid::new_v4()).await;
        one.apply_update(&update_with(4, "dirty")).await;

        assert_eq!(manager.flush_all().await, 1);
        assert_eq!(store.save_count(), 1);
        assert_eq!(manager.active_rooms().await, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_maintenance_expires_awareness() {
        let manager = RoomManager::new(Arc::new(MemoryStore::new()), quick_config());
        let room = manager.join("presence", Uuid::new_v4()).await;
        let mut rx = room.broadcast().subscribe();
        room.apply_awareness(&[AwarenessChange {
            client_id: 11,
            clock: 1,
            state: Some(Default::default()),
        }])
        .await;

        let report = manager
            .maintain(Instant::now() + Duration::from_millis(500))
            .await;
        assert_eq!(report.awareness_expired, 1);
        assert!(room.awareness_snapshot().await.is_empty());

        let relay = rx.recv().await.unwrap();
        let frame = Frame::decode(&relay.bytes).unwrap();
        match frame.message().unwrap() {
            crate::protocol::Message::Awareness(changes) => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].client_id, 11);
                assert!(changes[0].is_removal());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
