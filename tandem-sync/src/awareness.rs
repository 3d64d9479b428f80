//! Awareness: ephemeral presence state (who is here, where their cursor is).
//!
//! Entries are keyed by client id and versioned by a per-client clock. A
//! change with an older clock than the stored entry is ignored, so relayed
//! updates may arrive in any order. Entries that stay silent longer than the
//! configured timeout are swept out.
//!
//! ```text
//! client ──AwarenessUpdate──▶ session ──apply──▶ AwarenessStore
//!                                │
//!                                └──relay verbatim──▶ other sessions
//!
//! maintenance tick ──sweep(now, timeout)──▶ removal changes ──▶ room
//! ```
//!
//! Nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::ProtocolError;
use crate::update::DecodeError;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Display identity of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    /// CSS color string chosen by the client.
    pub color: String,
}

/// Selection in character offsets; `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u64,
    pub head: u64,
}

/// The record a client publishes about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user: Option<UserInfo>,
    pub cursor: Option<CursorRange>,
}

/// One entry of an `AwarenessUpdate` frame. `state: None` removes the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessChange {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<AwarenessState>,
}

impl AwarenessChange {
    /// Encode a batch of changes (bincode).
    pub fn encode_all(changes: &[AwarenessChange]) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(changes, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a batch of changes; the whole payload must be consumed.
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<AwarenessChange>, DecodeError> {
        let (changes, read): (Vec<AwarenessChange>, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| DecodeError::Awareness(e.to_string()))?;
        if read != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - read));
        }
        Ok(changes)
    }

    pub fn is_removal(&self) -> bool {
        self.state.is_none()
    }
}

/// Stored awareness record.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub state: AwarenessState,
    pub clock: u64,
    pub updated_at: Instant,
}

/// Client ids affected by a batch of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessDiff {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Awareness entries of one room.
#[derive(Debug, Default)]
pub struct AwarenessStore {
    entries: HashMap<u64, AwarenessEntry>,
}

impl AwarenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `state` for `client_id` unless a newer clock is already held.
    ///
    /// Returns `true` when the entry was written.
    pub fn set(&mut self, client_id: u64, clock: u64, state: AwarenessState) -> bool {
        self.set_at(client_id, clock, state, Instant::now())
    }

    pub fn set_at(
        &mut self,
        client_id: u64,
        clock: u64,
        state: AwarenessState,
        now: Instant,
    ) -> bool {
        if let Some(entry) = self.entries.get(&client_id) {
            if clock < entry.clock {
                return false;
            }
        }
        self.entries.insert(
            client_id,
            AwarenessEntry {
                state,
                clock,
                updated_at: now,
            },
        );
        true
    }

    /// Drop the entry and return the removal change to announce.
    pub fn remove(&mut self, client_id: u64) -> Option<AwarenessChange> {
        self.entries.remove(&client_id).map(|entry| AwarenessChange {
            client_id,
            clock: entry.clock + 1,
            state: None,
        })
    }

    /// Apply relayed changes, ignoring stale clocks.
    ///
    /// A change that repeats the stored state only refreshes the entry and
    /// is left out of the diff.
    pub fn apply(&mut self, changes: &[AwarenessChange], now: Instant) -> AwarenessDiff {
        let mut diff = AwarenessDiff::default();
        for change in changes {
            let current = self.entries.get(&change.client_id);
            let unchanged = current.is_some_and(|e| change.state.as_ref() == Some(&e.state));
            let current = current.map(|e| e.clock);
            match (&change.state, current) {
                (Some(state), current) => {
                    if self.set_at(change.client_id, change.clock, state.clone(), now) {
                        if unchanged {
                            continue;
                        }
                        if current.is_some() {
                            diff.updated.push(change.client_id);
                        } else {
                            diff.added.push(change.client_id);
                        }
                    }
                }
                (None, Some(clock)) if change.clock >= clock => {
                    self.entries.remove(&change.client_id);
                    diff.removed.push(change.client_id);
                }
                (None, _) => {}
            }
        }
        diff
    }

    /// Remove entries silent for longer than `timeout`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<AwarenessChange> {
        let stale: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.updated_at) > timeout)
            .map(|(id, _)| *id)
            .collect();
        stale.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Every live entry, for initial sync of a new session.
    pub fn snapshot(&self) -> Vec<AwarenessChange> {
        let mut changes: Vec<AwarenessChange> = self
            .entries
            .iter()
            .map(|(id, e)| AwarenessChange {
                client_id: *id,
                clock: e.clock,
                state: Some(e.state.clone()),
            })
            .collect();
        changes.sort_by_key(|c| c.client_id);
        changes
    }

    pub fn get(&self, client_id: u64) -> Option<&AwarenessEntry> {
        self.entries.get(&client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
