//! # tandem-sync: real-time collaborative text synchronization
//!
//! Several clients edit one text document per room over WebSockets. Every
//! replica holds the full operation log of a sequence CRDT, so concurrent
//! edits merge to the same text in any arrival order. The server keeps the
//! authoritative replica of each live room and saves it, debounced, to a
//! pluggable store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │   framed binary     │ (axum)      │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │ SyncSession per socket
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Document    │                     │ RoomManager │── PersistenceGateway
//! │ (local)     │                     │  └─ Room    │     (Memory / RocksDB)
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`]: Sequence CRDT over an operation log
//! - [`update`]: Binary encoding of updates and state vectors
//! - [`protocol`]: Framed wire messages
//! - [`awareness`]: Ephemeral presence entries
//! - [`broadcast`]: Per-room fan-out with backpressure
//! - [`room`]: Room lifecycle and debounced persistence
//! - [`session`]: Per-connection protocol state machine
//! - [`storage`]: Persistence gateway, memory and RocksDB stores
//! - [`server`]: HTTP + WebSocket listener
//! - [`client`]: WebSocket client for editors

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod crdt;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;
pub mod update;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessState, AwarenessStore, CursorRange, UserInfo};
pub use broadcast::{BroadcastGroup, BroadcastStats, SessionId};
pub use client::{ChangeOrigin, ConnectionState, SyncClient, SyncEvent};
pub use crdt::{ApplyOutcome, Document, TextChange};
pub use protocol::{Frame, Message, MessageKind, ProtocolError};
pub use room::{Room, RoomConfig, RoomManager};
pub use server::{ConfigError, ServerConfig, ServerStats, SyncServer};
pub use session::{SessionState, SyncSession};
pub use storage::{
    MemoryStore, PersistenceError, PersistenceGateway, RocksStore, RoomMetadata, StoreConfig,
};
pub use update::{DecodeError, OpId, StateVector, Update};
