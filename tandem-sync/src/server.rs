//! HTTP + WebSocket listener.
//!
//! Architecture:
//! ```text
//! Client A ──┐  GET /{room_id} (upgrade)
//!             ├── SyncSession ── Room (room_id) ── Document ── BroadcastGroup
//! Client B ──┘                      │
//!                                   ├── AwarenessStore (expired by maintenance)
//!                                   └── PersistenceGateway (debounced saves)
//!                                          ├── MemoryStore
//!                                          └── RocksStore (LZ4)
//! ```
//!
//! One task per connection. The task joins the room through the
//! [`RoomManager`], drives a [`SyncSession`] with frames from the socket and
//! relays from the room, and closes the session however the socket ends.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 3 & 8

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::broadcast::Relay;
use crate::protocol::{Frame, ProtocolError};
use crate::room::{RoomConfig, RoomManager};
use crate::session::SyncSession;
use crate::storage::{MemoryStore, PersistenceError, PersistenceGateway, RocksStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Quiet period before a dirty room is saved
    pub save_debounce: Duration,
    /// Upper bound on how long a mutation may stay unsaved
    pub save_max_debounce: Duration,
    /// Silence before an awareness entry expires
    pub awareness_timeout: Duration,
    /// Period of the awareness sweep / eviction retry task
    pub maintenance_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let room = RoomConfig::default();
        Self {
            bind_addr: "0.0.0.0:4000".to_string(),
            storage_path: None,
            broadcast_capacity: room.broadcast_capacity,
            save_debounce: room.save_debounce,
            save_max_debounce: room.save_max_debounce,
            awareness_timeout: room.awareness_timeout,
            maintenance_interval: Duration::from_millis(5_000),
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid PORT: {0:?}")]
    InvalidPort(String),
    #[error("invalid value for {var}: {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} must be positive")]
    Zero { var: &'static str },
}

impl ServerConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(raw))?,
            None => 4000,
        };

        let storage_path = lookup("TANDEM_DATA_DIR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let millis = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(var) {
                None => Ok(default),
                Some(raw) => {
                    let ms: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
                        var,
                        value: raw.clone(),
                    })?;
                    if ms == 0 {
                        return Err(ConfigError::Zero { var });
                    }
                    Ok(Duration::from_millis(ms))
                }
            }
        };

        let broadcast_capacity = match lookup("TANDEM_BROADCAST_CAPACITY") {
            None => defaults.broadcast_capacity,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) => {
                    return Err(ConfigError::Zero {
                        var: "TANDEM_BROADCAST_CAPACITY",
                    })
                }
                Ok(n) => n,
                Err(_) => {
                    return Err(ConfigError::InvalidNumber {
                        var: "TANDEM_BROADCAST_CAPACITY",
                        value: raw,
                    })
                }
            },
        };

        Ok(Self {
            bind_addr: format!("{host}:{port}"),
            storage_path,
            broadcast_capacity,
            save_debounce: millis("TANDEM_SAVE_DEBOUNCE_MS", defaults.save_debounce)?,
            save_max_debounce: millis("TANDEM_SAVE_MAX_DEBOUNCE_MS", defaults.save_max_debounce)?,
            awareness_timeout: millis("TANDEM_AWARENESS_TIMEOUT_MS", defaults.awareness_timeout)?,
            maintenance_interval: millis(
                "TANDEM_MAINTENANCE_INTERVAL_MS",
                defaults.maintenance_interval,
            )?,
        })
    }

    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            save_debounce: self.save_debounce,
            save_max_debounce: self.save_max_debounce.max(self.save_debounce),
            broadcast_capacity: self.broadcast_capacity,
            awareness_timeout: self.awareness_timeout,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Inbound frames dropped because they failed to decode
    pub rejected_messages: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_messages: AtomicU64,
}

impl AtomicServerStats {
    fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn message(&self, len: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn rejected(&self) {
        self.rejected_messages.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
struct AppState {
    rooms: RoomManager,
    stats: Arc<AtomicServerStats>,
}

#[derive(Debug, Serialize)]
struct CreatedRoom {
    id: String,
}

/// The sync server. Cheap to clone; clones share rooms and statistics.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    rooms: RoomManager,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Open the configured store and build the server.
    pub fn new(config: ServerConfig) -> Result<Self, PersistenceError> {
        let gateway: Arc<dyn PersistenceGateway> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path))?),
            None => {
                log::warn!("No data directory configured, documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_gateway(config, gateway))
    }

    /// Build the server on an existing store.
    pub fn with_gateway(config: ServerConfig, gateway: Arc<dyn PersistenceGateway>) -> Self {
        let rooms = RoomManager::new(gateway, config.room_config());
        Self {
            config,
            rooms,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Routes of the listener.
    pub fn router(&self) -> Router {
        let state = AppState {
            rooms: self.rooms.clone(),
            stats: self.stats.clone(),
        };
        Router::new()
            .route("/", get(|| async { "Collaboration Server Running" }))
            .route("/health", get(|| async { "OK" }))
            .route("/rooms", post(create_room))
            .route("/{room_id}", get(room_socket))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener. Dirty rooms are flushed once the
    /// listener stops.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let maintenance = self.spawn_maintenance();

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        maintenance.abort();
        let _ = maintenance.await;
        let saved = self.rooms.flush_all().await;
        log::info!("Sync server stopped, flushed {saved} rooms");
        result
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let rooms = self.rooms.clone();
        let period = self.config.maintenance_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let report = rooms.maintain(Instant::now()).await;
                if report.awareness_expired > 0 || report.rooms_evicted > 0 {
                    log::debug!(
                        "Maintenance: {} awareness entries expired, {} rooms evicted",
                        report.awareness_expired,
                        report.rooms_evicted
                    );
                }
            }
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            rejected_messages: self.stats.rejected_messages.load(Ordering::Relaxed),
            active_rooms: self.rooms.room_count().await,
        }
    }
}

async fn create_room() -> (StatusCode, Json<CreatedRoom>) {
    let id = Uuid::new_v4().to_string();
    log::debug!("Issued room id {id}");
    (StatusCode::CREATED, Json(CreatedRoom { id }))
}

async fn room_socket(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, state))
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

async fn handle_socket(socket: WebSocket, room_id: String, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let session_id = Uuid::new_v4();

    let room = state.rooms.join(&room_id, session_id).await;
    // Subscribed before the handshake so no relay falls in between.
    let mut relays = room.broadcast().subscribe();
    let mut session = SyncSession::new(session_id, room);

    state.stats.connection_opened();
    log::info!("Session {session_id} connected to room {room_id}");

    match drive_session(&mut session, &mut sink, &mut stream, &mut relays, &state.stats).await {
        Ok(()) => log::info!("Session {session_id} disconnected from room {room_id}"),
        Err(e) => log::warn!("Session {session_id} on room {room_id} ended: {e}"),
    }

    session.close(&state.rooms).await;
    state.stats.connection_closed();
}

async fn drive_session(
    session: &mut SyncSession,
    sink: &mut WsSink,
    stream: &mut WsStream,
    relays: &mut Receiver<Relay>,
    stats: &AtomicServerStats,
) -> Result<(), ProtocolError> {
    for frame in session.open().await? {
        send_frame(sink, &frame).await?;
    }

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    stats.message(data.len());
                    match session.receive(&data).await {
                        Ok(replies) => {
                            for reply in &replies {
                                send_frame(sink, reply).await?;
                            }
                        }
                        Err(e) if e.is_fatal() => {
                            log::warn!("Session {}: closing, {e}", session.id());
                            let close = CloseFrame {
                                code: close_code::PROTOCOL,
                                reason: e.to_string().into(),
                            };
                            let _ = sink.send(Message::Close(Some(close))).await;
                            return Ok(());
                        }
                        Err(e) => {
                            stats.rejected();
                            log::warn!("Session {}: dropped message, {e}", session.id());
                        }
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    stats.rejected();
                    log::warn!("Session {}: ignoring text message", session.id());
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ProtocolError::Transport(e.to_string())),
            },

            relay = relays.recv() => match relay {
                Ok(relay) => {
                    if session.accepts(&relay) {
                        sink.send(Message::Binary(relay.bytes.to_vec().into()))
                            .await
                            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    session.room().broadcast().record_lag(skipped);
                    log::warn!(
                        "Session {} lagged by {skipped} frames, resending full state",
                        session.id()
                    );
                    let frame = session.resync_frame().await;
                    send_frame(sink, &frame).await?;
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), ProtocolError> {
    sink.send(Message::Binary(frame.encode().into()))
        .await
        .map_err(|e| ProtocolError::Transport(e.to_string()))
}
