//! Binary encoding of CRDT updates and state vectors.
//!
//! Update layout (all integers are unsigned LEB128 varints):
//! ```text
//! ┌─────────┬──────────┬──────────────────────────────────────────────────────────┐
//! │ version │ op count │ op*                                                      │
//! │ 1 byte  │ varint   │ replica │ counter │ kind │ anchor │ payload len │ payload │
//! └─────────┴──────────┴──────────────────────────────────────────────────────────┘
//! ```
//!
//! The anchor is a flag byte followed by the ids it announces:
//! bit 0 = left origin (insert) or target (delete), bit 1 = right origin.
//! Insert payloads are UTF-8 text; delete payloads are the varint length of
//! the deleted id run.
//!
//! State vectors: `version │ entry count │ (replica, counter)*`.

use std::collections::BTreeMap;

use thiserror::Error;

/// Encoding version written at the start of every update and state vector.
pub const ENCODING_VERSION: u8 = 1;

const KIND_INSERT: u8 = 0;
const KIND_DELETE: u8 = 1;

const ANCHOR_LEFT: u8 = 0b01;
const ANCHOR_RIGHT: u8 = 0b10;

/// Globally unique operation id: `(replica, counter)`.
///
/// Ordering is replica first, then counter, which is also the tie-break
/// order for concurrent inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId {
    pub replica: u64,
    pub counter: u64,
}

impl OpId {
    pub const fn new(replica: u64, counter: u64) -> Self {
        Self { replica, counter }
    }

    /// Id `n` counters further on the same replica.
    pub const fn offset(self, n: u64) -> Self {
        Self {
            replica: self.replica,
            counter: self.counter.saturating_add(n),
        }
    }
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    /// Insert `text` between `origin` and `right_origin`.
    ///
    /// Character `i` of the run gets id `op.id.offset(i)`.
    Insert {
        origin: Option<OpId>,
        right_origin: Option<OpId>,
        text: String,
    },
    /// Tombstone `len` characters starting at `target` (same replica,
    /// consecutive counters).
    Delete { target: OpId, len: u64 },
}

/// A single CRDT operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: OpId,
    pub kind: OpKind,
}

impl Operation {
    pub fn insert(
        id: OpId,
        origin: Option<OpId>,
        right_origin: Option<OpId>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind: OpKind::Insert {
                origin,
                right_origin,
                text: text.into(),
            },
        }
    }

    pub fn delete(id: OpId, target: OpId, len: u64) -> Self {
        Self {
            id,
            kind: OpKind::Delete { target, len },
        }
    }

    /// Number of counters this operation consumes on its replica.
    pub fn span(&self) -> u64 {
        match &self.kind {
            OpKind::Insert { text, .. } => text.chars().count() as u64,
            OpKind::Delete { .. } => 1,
        }
    }

    /// Counter of the last id covered by this operation, or `None` when the
    /// run does not fit in the counter space.
    pub fn end_counter(&self) -> Option<u64> {
        self.id.counter.checked_add(self.span().saturating_sub(1))
    }

    /// Counter of the last id covered by this operation.
    pub fn last_counter(&self) -> u64 {
        self.id.counter.saturating_add(self.span().saturating_sub(1))
    }
}

/// A self-contained batch of operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub ops: Vec<Operation>,
}

impl Update {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Serialize to the binary update format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.ops.len() * 16);
        buf.push(ENCODING_VERSION);
        write_var(&mut buf, self.ops.len() as u64);

        for op in &self.ops {
            write_var(&mut buf, op.id.replica);
            write_var(&mut buf, op.id.counter);
            match &op.kind {
                OpKind::Insert {
                    origin,
                    right_origin,
                    text,
                } => {
                    buf.push(KIND_INSERT);
                    let mut flags = 0;
                    if origin.is_some() {
                        flags |= ANCHOR_LEFT;
                    }
                    if right_origin.is_some() {
                        flags |= ANCHOR_RIGHT;
                    }
                    buf.push(flags);
                    if let Some(id) = origin {
                        write_id(&mut buf, *id);
                    }
                    if let Some(id) = right_origin {
                        write_id(&mut buf, *id);
                    }
                    write_var(&mut buf, text.len() as u64);
                    buf.extend_from_slice(text.as_bytes());
                }
                OpKind::Delete { target, len } => {
                    buf.push(KIND_DELETE);
                    buf.push(ANCHOR_LEFT);
                    write_id(&mut buf, *target);
                    let mut payload = Vec::with_capacity(4);
                    write_var(&mut payload, *len);
                    write_var(&mut buf, payload.len() as u64);
                    buf.extend_from_slice(&payload);
                }
            }
        }

        buf
    }

    /// Deserialize from the binary update format.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        reader.expect_version()?;
        let count = reader.read_len()?;
        let mut ops = Vec::with_capacity(count.min(reader.remaining()));

        for _ in 0..count {
            let id = reader.read_id()?;
            let kind = reader.read_u8()?;
            let flags = reader.read_u8()?;
            if flags & !(ANCHOR_LEFT | ANCHOR_RIGHT) != 0 {
                return Err(DecodeError::Malformed("unknown anchor flags"));
            }

            let op = match kind {
                KIND_INSERT => {
                    let origin = if flags & ANCHOR_LEFT != 0 {
                        Some(reader.read_id()?)
                    } else {
                        None
                    };
                    let right_origin = if flags & ANCHOR_RIGHT != 0 {
                        Some(reader.read_id()?)
                    } else {
                        None
                    };
                    let len = reader.read_len()?;
                    let payload = reader.read_bytes(len)?;
                    if payload.is_empty() {
                        return Err(DecodeError::EmptyPayload);
                    }
                    let text = std::str::from_utf8(payload)
                        .map_err(|_| DecodeError::InvalidUtf8)?
                        .to_owned();
                    Operation::insert(id, origin, right_origin, text)
                }
                KIND_DELETE => {
                    if flags != ANCHOR_LEFT {
                        return Err(DecodeError::Malformed("delete must anchor on a target"));
                    }
                    let target = reader.read_id()?;
                    let len = reader.read_len()?;
                    let mut payload = Reader::new(reader.read_bytes(len)?);
                    let run = payload.read_var()?;
                    payload.finish()?;
                    if run == 0 {
                        return Err(DecodeError::EmptyPayload);
                    }
                    Operation::delete(id, target, run)
                }
                tag => {
                    return Err(DecodeError::UnknownKind {
                        what: "operation",
                        tag,
                    })
                }
            };
            if op.end_counter().is_none() {
                return Err(DecodeError::Malformed("operation counter overflows"));
            }
            ops.push(op);
        }

        reader.finish()?;
        Ok(Self { ops })
    }
}

/// Highest counter integrated per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateVector(BTreeMap<u64, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter seen from `replica` (0 when nothing was seen).
    pub fn get(&self, replica: u64) -> u64 {
        self.0.get(&replica).copied().unwrap_or(0)
    }

    pub fn set(&mut self, replica: u64, counter: u64) {
        if counter == 0 {
            self.0.remove(&replica);
        } else {
            self.0.insert(replica, counter);
        }
    }

    /// Whether the id has already been integrated.
    pub fn contains(&self, id: OpId) -> bool {
        id.counter <= self.get(id.replica)
    }

    /// Whether every id of the operation is covered by this vector.
    pub fn dominates(&self, op: &Operation) -> bool {
        op.last_counter() <= self.get(op.id.replica)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.0.iter().map(|(r, c)| (*r, *c))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.0.len() * 8);
        buf.push(ENCODING_VERSION);
        write_var(&mut buf, self.0.len() as u64);
        for (replica, counter) in &self.0 {
            write_var(&mut buf, *replica);
            write_var(&mut buf, *counter);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        reader.expect_version()?;
        let count = reader.read_len()?;
        let mut sv = Self::new();
        for _ in 0..count {
            let replica = reader.read_var()?;
            let counter = reader.read_var()?;
            sv.set(replica, counter);
        }
        reader.finish()?;
        Ok(sv)
    }
}

impl FromIterator<(u64, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        let mut sv = Self::new();
        for (replica, counter) in iter {
            sv.set(replica, counter);
        }
        sv
    }
}

/// Errors raised while decoding wire payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unsupported encoding version {found} (this server speaks version {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },
    #[error("message truncated")]
    TruncatedMessage,
    #[error("unknown {what} tag {tag}")]
    UnknownKind { what: &'static str, tag: u8 },
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("operation payload is empty")]
    EmptyPayload,
    #[error("varint does not fit in 64 bits")]
    VarintOverflow,
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("invalid awareness payload: {0}")]
    Awareness(String),
}

// ─── Varint helpers ─────────────────────────────────────────────────────────

pub(crate) fn write_var(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_id(buf: &mut Vec<u8>, id: OpId) {
    write_var(buf, id.replica);
    write_var(buf, id.counter);
}

/// Cursor over a byte slice that never reads past the end.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(DecodeError::TruncatedMessage)?;
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn read_var(&mut self) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(DecodeError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow);
            }
        }
    }

    /// A varint length that must fit in the remaining input.
    pub(crate) fn read_len(&mut self) -> Result<usize, DecodeError> {
        let len = self.read_var()?;
        usize::try_from(len).map_err(|_| DecodeError::TruncatedMessage)
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::TruncatedMessage);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_id(&mut self) -> Result<OpId, DecodeError> {
        let replica = self.read_var()?;
        let counter = self.read_var()?;
        if counter == 0 {
            return Err(DecodeError::Malformed("operation counters start at 1"));
        }
        Ok(OpId::new(replica, counter))
    }

    fn expect_version(&mut self) -> Result<(), DecodeError> {
        let found = self.read_u8()?;
        if found != ENCODING_VERSION {
            return Err(DecodeError::UnsupportedVersion {
                found,
                expected: ENCODING_VERSION,
            });
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}
