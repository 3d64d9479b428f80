//! Sequence CRDT for plain text.
//!
//! Every character is an element carrying the id of the operation that
//! created it plus the ids of its left and right neighbours at creation time
//! (its *origins*). Concurrent inserts between the same origins are ordered by
//! replica id, so every replica that integrated the same operations holds the
//! same element sequence. Deleted characters stay in the sequence as
//! tombstones.
//!
//! Operations are atomic: an operation is integrated once its same-replica
//! predecessor and both origins are known, otherwise it is parked until they
//! arrive.

mod sequence;

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use crate::update::{DecodeError, OpId, OpKind, Operation, StateVector, Update};
use sequence::{Element, Sequence};

/// Parked operations allowed per replica.
pub const MAX_PENDING_PER_REPLICA: usize = 512;
/// Parked operations allowed in total.
pub const MAX_PENDING: usize = 4096;
/// How far past the next expected counter a parked operation may start.
pub const MAX_COUNTER_GAP: u64 = 1 << 20;

/// Visible-text delta produced by integrating operations.
///
/// Indices are character (not byte) offsets into the text as it was right
/// before the change is applied; a list of changes applies in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextChange {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
}

/// Result of [`Document::apply_remote_update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub changes: Vec<TextChange>,
    /// Operations not seen before (integrated now or parked).
    pub received: usize,
    /// Operations integrated by this call, including previously parked ones.
    pub integrated: usize,
    /// Operations that were already known or already parked.
    pub duplicates: usize,
    /// Operations still waiting for dependencies after this call.
    pub pending: usize,
    /// Operations dropped: anchors that do not name characters, counter
    /// ranges past `u64::MAX`, or no room left to park them.
    pub rejected: usize,
}

impl ApplyOutcome {
    /// Whether the update carried anything this replica had not seen.
    pub fn has_new_ops(&self) -> bool {
        self.received > 0
    }
}

/// A replica of a shared text document.
#[derive(Debug, Clone)]
pub struct Document {
    replica: u64,
    elements: Sequence,
    /// Integrated operations in integration order.
    log: Vec<Operation>,
    state: StateVector,
    /// Operations waiting for dependencies, keyed by id.
    pending: BTreeMap<OpId, Operation>,
    /// Delete runs naming characters that have not been integrated yet:
    /// `(first id, exclusive end counter)`.
    deferred_deletes: Vec<(OpId, u64)>,
}

impl Document {
    pub fn new(replica: u64) -> Self {
        Self {
            replica,
            elements: Sequence::default(),
            log: Vec::new(),
            state: StateVector::new(),
            pending: BTreeMap::new(),
            deferred_deletes: Vec::new(),
        }
    }

    /// Rebuild a document from bytes produced by [`Document::encode_state`].
    pub fn from_state(replica: u64, bytes: &[u8]) -> Result<Self, DecodeError> {
        let update = Update::decode(bytes)?;
        let mut doc = Self::new(replica);
        doc.apply_remote_update(&update);
        Ok(doc)
    }

    pub fn replica(&self) -> u64 {
        self.replica
    }

    /// The visible text.
    pub fn text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.ch)
            .collect()
    }

    /// Visible length in characters.
    pub fn len(&self) -> usize {
        self.elements.visible()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_vector(&self) -> StateVector {
        self.state.clone()
    }

    pub fn operation_count(&self) -> usize {
        self.log.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Replace the visible characters in `range` with `text`.
    ///
    /// Indices are character offsets and are clamped to the current length.
    /// Returns the operations produced, already integrated locally.
    pub fn apply_local_edit(&mut self, range: Range<usize>, text: &str) -> Update {
        let visible = self.len();
        let start = range.start.min(visible);
        let end = range.end.clamp(start, visible);
        let mut ops = Vec::new();
        let mut changes = Vec::new();

        if end > start {
            let first = self
                .elements
                .visible_position(start)
                .unwrap_or(self.elements.len());
            let targets: Vec<OpId> = self
                .elements
                .iter_from(first)
                .filter(|e| !e.deleted)
                .take(end - start)
                .map(|e| e.id)
                .collect();
            for (target, len) in id_runs(&targets) {
                let op = Operation::delete(self.next_id(), target, len);
                self.integrate(&op, &mut changes);
                ops.push(op);
            }
        }

        if !text.is_empty() {
            let left = start
                .checked_sub(1)
                .and_then(|i| self.elements.visible_position(i));
            let origin = left.and_then(|p| self.elements.get(p)).map(|e| e.id);
            let right_origin = self.elements.get(left.map_or(0, |p| p + 1)).map(|e| e.id);
            let op = Operation::insert(self.next_id(), origin, right_origin, text);
            self.integrate(&op, &mut changes);
            ops.push(op);
        }

        Update::new(ops)
    }

    /// Decode and merge a remote update.
    pub fn apply_remote_bytes(&mut self, bytes: &[u8]) -> Result<ApplyOutcome, DecodeError> {
        let update = Update::decode(bytes)?;
        Ok(self.apply_remote_update(&update))
    }

    /// Merge a remote update. Re-applying known operations is a no-op and
    /// operations may arrive in any order.
    pub fn apply_remote_update(&mut self, update: &Update) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        for op in &update.ops {
            if self.state.contains(op.id) || self.pending.contains_key(&op.id) {
                outcome.duplicates += 1;
                continue;
            }
            if op.end_counter().is_none() {
                log::warn!("Dropping operation {:?}: counter range overflows", op.id);
                outcome.rejected += 1;
                continue;
            }

            if self.is_ready(op) {
                outcome.received += 1;
                self.integrate_counted(op, &mut outcome);
                self.drain_pending(&mut outcome);
            } else if let Err(reason) = self.check_parkable(op) {
                log::warn!("Dropping operation {:?}: {reason}", op.id);
                outcome.rejected += 1;
            } else {
                outcome.received += 1;
                self.pending.insert(op.id, op.clone());
            }
        }

        outcome.pending = self.pending.len();
        outcome
    }

    /// Operations the holder of `remote` has not seen, in causal order.
    pub fn diff(&self, remote: &StateVector) -> Update {
        let ops = self
            .log
            .iter()
            .chain(self.pending.values())
            .filter(|op| !remote.dominates(op))
            .cloned()
            .collect();
        Update::new(ops)
    }

    /// Full document state: every integrated operation followed by the
    /// parked ones.
    pub fn encode_state(&self) -> Vec<u8> {
        self.state_update().encode()
    }

    pub fn state_update(&self) -> Update {
        Update::new(self.log.iter().chain(self.pending.values()).cloned().collect())
    }

    fn next_id(&self) -> OpId {
        OpId::new(self.replica, self.state.get(self.replica) + 1)
    }

    fn is_ready(&self, op: &Operation) -> bool {
        if op.id.counter != self.state.get(op.id.replica).saturating_add(1) {
            return false;
        }
        match &op.kind {
            OpKind::Insert {
                origin,
                right_origin,
                ..
            } => {
                origin.map_or(true, |id| self.state.contains(id))
                    && right_origin.map_or(true, |id| self.state.contains(id))
            }
            OpKind::Delete { .. } => true,
        }
    }

    /// Whether `op` may wait in the pending queue.
    fn check_parkable(&self, op: &Operation) -> Result<(), &'static str> {
        let expected = self.state.get(op.id.replica).saturating_add(1);
        if op.id.counter.saturating_sub(expected) > MAX_COUNTER_GAP {
            return Err("counter too far ahead");
        }
        if self.pending.len() >= MAX_PENDING {
            return Err("pending queue is full");
        }
        let parked = self
            .pending
            .range(OpId::new(op.id.replica, 0)..=OpId::new(op.id.replica, u64::MAX))
            .count();
        if parked >= MAX_PENDING_PER_REPLICA {
            return Err("too many pending operations from this replica");
        }
        Ok(())
    }

    /// Integrate parked operations until none is ready. Only the next
    /// expected id of each replica can be ready.
    fn drain_pending(&mut self, outcome: &mut ApplyOutcome) {
        let mut progressed = true;
        while progressed {
            progressed = false;
            let mut replica = self.pending.keys().next().map(|id| id.replica);

            while let Some(r) = replica {
                let next = OpId::new(r, self.state.get(r).saturating_add(1));
                let ready = self.pending.get(&next).is_some_and(|op| self.is_ready(op));
                if ready {
                    if let Some(op) = self.pending.remove(&next) {
                        self.integrate_counted(&op, outcome);
                        progressed = true;
                    }
                }
                replica = r.checked_add(1).and_then(|from| {
                    self.pending
                        .range(OpId::new(from, 0)..)
                        .next()
                        .map(|(id, _)| id.replica)
                });
            }
        }
    }

    fn integrate_counted(&mut self, op: &Operation, outcome: &mut ApplyOutcome) {
        if self.integrate(op, &mut outcome.changes) {
            outcome.integrated += 1;
        } else {
            outcome.rejected += 1;
        }
    }

    /// Integrate a ready operation. Returns `false` when its anchors name ids
    /// that are not characters.
    fn integrate(&mut self, op: &Operation, changes: &mut Vec<TextChange>) -> bool {
        match &op.kind {
            OpKind::Insert {
                origin,
                right_origin,
                text,
            } => {
                let left = match origin {
                    Some(id) => match self.elements.position(*id) {
                        Some(pos) => Some(pos),
                        None => {
                            log::warn!("Rejecting insert {:?}: origin {:?} is not a character", op.id, id);
                            return false;
                        }
                    },
                    None => None,
                };
                let right = match right_origin {
                    Some(id) => match self.elements.position(*id) {
                        Some(pos) => Some(pos),
                        None => {
                            log::warn!(
                                "Rejecting insert {:?}: right origin {:?} is not a character",
                                op.id,
                                id
                            );
                            return false;
                        }
                    },
                    None => None,
                };
                self.integrate_insert(op.id, *origin, *right_origin, left, right, text, changes);
            }
            OpKind::Delete { target, len } => {
                self.integrate_delete(*target, *len, changes);
                self.state.set(op.id.replica, op.id.counter);
            }
        }
        self.log.push(op.clone());
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn integrate_insert(
        &mut self,
        first: OpId,
        origin: Option<OpId>,
        right_origin: Option<OpId>,
        mut left: Option<usize>,
        mut right: Option<usize>,
        text: &str,
        changes: &mut Vec<TextChange>,
    ) {
        // (start index, text, char count) of the visible run being built.
        let mut run: Option<(usize, String, usize)> = None;
        let mut last_visible: Option<(usize, usize)> = None;

        for (i, ch) in text.chars().enumerate() {
            let id = first.offset(i as u64);
            let char_origin = if i == 0 { origin } else { Some(first.offset(i as u64 - 1)) };
            let bound = right.unwrap_or(self.elements.len());
            let pos = self.place(id, char_origin, right_origin, left, bound);
            let deleted = self.take_deferred_delete(id);

            self.elements.insert(
                pos,
                Element {
                    id,
                    origin: char_origin,
                    right_origin,
                    ch,
                    deleted,
                },
            );
            self.state.set(id.replica, id.counter);
            if let Some(r) = right.as_mut() {
                *r += 1;
            }
            left = Some(pos);

            if deleted {
                continue;
            }
            let index = match last_visible {
                Some((prev_pos, prev_index)) if prev_pos + 1 == pos => prev_index + 1,
                _ => self.elements.visible_before(pos),
            };
            last_visible = Some((pos, index));

            match run.as_mut() {
                Some((start, s, n)) if *start + *n == index => {
                    s.push(ch);
                    *n += 1;
                }
                _ => {
                    if let Some((start, s, _)) = run.take() {
                        changes.push(TextChange::Insert { index: start, text: s });
                    }
                    run = Some((index, ch.to_string(), 1));
                }
            }
        }

        if let Some((start, s, _)) = run {
            changes.push(TextChange::Insert { index: start, text: s });
        }
        self.prune_deferred_deletes();
    }

    /// Position at which to insert `id`, scanning the elements between its
    /// left origin (`left`) and right origin (`bound`).
    fn place(
        &self,
        id: OpId,
        origin: Option<OpId>,
        right_origin: Option<OpId>,
        left: Option<usize>,
        bound: usize,
    ) -> usize {
        let mut scan = left.map_or(0, |p| p + 1);
        let mut dest = scan;
        let mut before_origin: HashSet<OpId> = HashSet::new();
        let mut conflicting: HashSet<OpId> = HashSet::new();

        while scan < bound {
            let Some(other) = self.elements.get(scan) else {
                break;
            };
            before_origin.insert(other.id);
            conflicting.insert(other.id);

            if other.origin == origin {
                if other.id.replica < id.replica {
                    dest = scan + 1;
                    conflicting.clear();
                } else if other.right_origin == right_origin {
                    break;
                }
            } else if let Some(o) = other.origin.filter(|o| before_origin.contains(o)) {
                if !conflicting.contains(&o) {
                    dest = scan + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
            scan += 1;
        }

        dest
    }

    fn integrate_delete(&mut self, target: OpId, len: u64, changes: &mut Vec<TextChange>) {
        let end = target.counter.saturating_add(len);
        let known_end = end.min(self.state.get(target.replica) + 1);
        let mut hint: Option<usize> = None;

        for counter in target.counter..known_end.max(target.counter) {
            let id = OpId::new(target.replica, counter);
            let pos = hint
                .filter(|&p| self.elements.get(p).is_some_and(|e| e.id == id))
                .or_else(|| self.elements.position(id));
            let Some(pos) = pos else { continue };
            hint = Some(pos + 1);

            if !self.elements.mark_deleted(pos) {
                continue;
            }
            let index = self.elements.visible_before(pos);
            match changes.last_mut() {
                Some(TextChange::Delete { index: i, len }) if *i == index => *len += 1,
                _ => changes.push(TextChange::Delete { index, len: 1 }),
            }
        }

        if end > known_end {
            let from = known_end.max(target.counter);
            self.deferred_deletes
                .push((OpId::new(target.replica, from), end));
        }
    }

    fn take_deferred_delete(&self, id: OpId) -> bool {
        self.deferred_deletes
            .iter()
            .any(|(start, end)| start.replica == id.replica && (start.counter..*end).contains(&id.counter))
    }

    fn prune_deferred_deletes(&mut self) {
        let state = &self.state;
        self.deferred_deletes
            .retain(|(start, end)| end - 1 > state.get(start.replica));
    }

}

/// Group ids into runs of consecutive counters on one replica.
fn id_runs(ids: &[OpId]) -> Vec<(OpId, u64)> {
    let mut runs: Vec<(OpId, u64)> = Vec::new();
    for id in ids {
        match runs.last_mut() {
            Some((start, len)) if start.replica == id.replica && start.counter + *len == id.counter => {
                *len += 1;
            }
            _ => runs.push((*id, 1)),
        }
    }
    runs
}
