//! Wire framing for the sync protocol.
//!
//! Every WebSocket binary message carries exactly one frame:
//! ```text
//! ┌──────────┬────────────────┬─────────────┐
//! │ kind: u8 │ len: varint    │ payload     │
//! └──────────┴────────────────┴─────────────┘
//! ```
//!
//! | kind | name            | payload                          |
//! |------|-----------------|----------------------------------|
//! | 0    | SyncStep1       | encoded [`StateVector`]          |
//! | 1    | SyncStep2       | encoded [`Update`] (diff)        |
//! | 2    | Update          | encoded [`Update`]               |
//! | 3    | AwarenessUpdate | bincode `Vec<AwarenessChange>`   |
//! | 4    | QueryAwareness  | empty                            |

use thiserror::Error;

use crate::awareness::AwarenessChange;
use crate::update::{write_var, DecodeError, Reader, StateVector, Update};

/// Frame kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    SyncStep1 = 0,
    SyncStep2 = 1,
    Update = 2,
    AwarenessUpdate = 3,
    QueryAwareness = 4,
}

impl TryFrom<u8> for MessageKind {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::SyncStep1),
            1 => Ok(Self::SyncStep2),
            2 => Ok(Self::Update),
            3 => Ok(Self::AwarenessUpdate),
            4 => Ok(Self::QueryAwareness),
            tag => Err(DecodeError::UnknownKind {
                what: "message",
                tag,
            }),
        }
    }
}

/// A framed message with its payload still encoded.
///
/// Keeping the payload raw lets the server relay frames without
/// re-encoding them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// A frame with its payload decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SyncStep1(StateVector),
    SyncStep2(Update),
    Update(Update),
    Awareness(Vec<AwarenessChange>),
    QueryAwareness,
}

impl Frame {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn sync_step1(sv: &StateVector) -> Self {
        Self::new(MessageKind::SyncStep1, sv.encode())
    }

    pub fn sync_step2(diff: &Update) -> Self {
        Self::new(MessageKind::SyncStep2, diff.encode())
    }

    pub fn update(update: &Update) -> Self {
        Self::new(MessageKind::Update, update.encode())
    }

    pub fn awareness(changes: &[AwarenessChange]) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageKind::AwarenessUpdate,
            AwarenessChange::encode_all(changes)?,
        ))
    }

    pub fn query_awareness() -> Self {
        Self::new(MessageKind::QueryAwareness, Vec::new())
    }

    /// Serialize to bytes for a WebSocket binary message.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + 6);
        buf.push(self.kind as u8);
        write_var(&mut buf, self.payload.len() as u64);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse exactly one frame; trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        let kind = MessageKind::try_from(reader.read_u8()?)?;
        let len = reader.read_len()?;
        let payload = reader.read_bytes(len)?.to_vec();
        reader.finish()?;
        Ok(Self { kind, payload })
    }

    /// Decode the payload according to the frame kind.
    pub fn message(&self) -> Result<Message, DecodeError> {
        match self.kind {
            MessageKind::SyncStep1 => Ok(Message::SyncStep1(StateVector::decode(&self.payload)?)),
            MessageKind::SyncStep2 => Ok(Message::SyncStep2(Update::decode(&self.payload)?)),
            MessageKind::Update => Ok(Message::Update(Update::decode(&self.payload)?)),
            MessageKind::AwarenessUpdate => Ok(Message::Awareness(AwarenessChange::decode_all(
                &self.payload,
            )?)),
            MessageKind::QueryAwareness => {
                if self.payload.is_empty() {
                    Ok(Message::QueryAwareness)
                } else {
                    Err(DecodeError::TrailingBytes(self.payload.len()))
                }
            }
        }
    }
}

/// Errors surfaced by sessions and clients.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("failed to encode awareness: {0}")]
    Encode(String),
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProtocolError {
    /// Whether the connection has to be torn down.
    ///
    /// Malformed messages are dropped; a peer speaking another encoding
    /// version cannot be talked to at all.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Decode(DecodeError::UnsupportedVersion { .. }) => true,
            Self::Decode(_) | Self::Encode(_) => false,
            Self::Closed | Self::Transport(_) => true,
        }
    }
}
