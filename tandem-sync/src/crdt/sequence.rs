//! Element storage for [`Document`](super::Document).
//!
//! Elements live in document order inside bounded blocks. Each block keeps
//! its visible count, and every element id maps to the stable key of the
//! block that holds it, so lookups by id, by position or by visible index
//! cost one pass over the block counters plus one block scan.

use std::collections::HashMap;

use crate::update::OpId;

/// Blocks split in half once they grow past this many elements.
const MAX_BLOCK_LEN: usize = 256;

#[derive(Debug, Clone)]
pub(super) struct Element {
    pub id: OpId,
    pub origin: Option<OpId>,
    pub right_origin: Option<OpId>,
    pub ch: char,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
struct Block {
    key: usize,
    elements: Vec<Element>,
    visible: usize,
}

#[derive(Debug, Clone, Default)]
pub(super) struct Sequence {
    blocks: Vec<Block>,
    /// Block key of every element.
    location: HashMap<OpId, usize>,
    /// Index into `blocks` of each block key. Blocks are never removed, so
    /// keys stay dense.
    block_index: Vec<usize>,
    len: usize,
    visible: usize,
}

impl Sequence {
    /// Number of elements, tombstones included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of visible characters.
    pub fn visible(&self) -> usize {
        self.visible
    }

    pub fn get(&self, pos: usize) -> Option<&Element> {
        let (b, offset) = self.locate(pos)?;
        self.blocks[b].elements.get(offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> + '_ {
        self.blocks.iter().flat_map(|block| block.elements.iter())
    }

    /// Elements from `pos` to the end.
    pub fn iter_from(&self, pos: usize) -> impl Iterator<Item = &Element> + '_ {
        let (first, offset) = self.locate(pos).unwrap_or((self.blocks.len(), 0));
        self.blocks[first..]
            .iter()
            .enumerate()
            .flat_map(move |(i, block)| {
                let skip = if i == 0 { offset } else { 0 };
                block.elements[skip..].iter()
            })
    }

    /// Position of the element with `id`.
    pub fn position(&self, id: OpId) -> Option<usize> {
        let key = *self.location.get(&id)?;
        let b = self.block_index[key];
        let offset = self.blocks[b].elements.iter().position(|e| e.id == id)?;
        let before: usize = self.blocks[..b].iter().map(|block| block.elements.len()).sum();
        Some(before + offset)
    }

    /// Visible characters strictly before `pos`.
    pub fn visible_before(&self, pos: usize) -> usize {
        let mut remaining = pos;
        let mut count = 0;
        for block in &self.blocks {
            if remaining < block.elements.len() {
                return count
                    + block.elements[..remaining]
                        .iter()
                        .filter(|e| !e.deleted)
                        .count();
            }
            remaining -= block.elements.len();
            count += block.visible;
        }
        count
    }

    /// Position of the visible character at `index`.
    pub fn visible_position(&self, index: usize) -> Option<usize> {
        let mut remaining = index;
        let mut base = 0;
        for block in &self.blocks {
            if remaining < block.visible {
                let offset = block
                    .elements
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| !e.deleted)
                    .nth(remaining)
                    .map(|(offset, _)| offset)?;
                return Some(base + offset);
            }
            remaining -= block.visible;
            base += block.elements.len();
        }
        None
    }

    /// Insert `element` so that it ends up at `pos` (clamped to the length).
    pub fn insert(&mut self, pos: usize, element: Element) {
        if self.blocks.is_empty() {
            self.blocks.push(Block {
                key: 0,
                elements: Vec::new(),
                visible: 0,
            });
            self.block_index.push(0);
        }

        let mut b = 0;
        let mut offset = pos.min(self.len);
        while offset > self.blocks[b].elements.len() && b + 1 < self.blocks.len() {
            offset -= self.blocks[b].elements.len();
            b += 1;
        }

        let block = &mut self.blocks[b];
        if !element.deleted {
            block.visible += 1;
            self.visible += 1;
        }
        self.location.insert(element.id, block.key);
        block.elements.insert(offset, element);
        self.len += 1;

        if block.elements.len() > MAX_BLOCK_LEN {
            self.split(b);
        }
    }

    /// Tombstone the element at `pos`. Returns `false` if it was already
    /// deleted or does not exist.
    pub fn mark_deleted(&mut self, pos: usize) -> bool {
        let Some((b, offset)) = self.locate(pos) else {
            return false;
        };
        let block = &mut self.blocks[b];
        let element = &mut block.elements[offset];
        if element.deleted {
            return false;
        }
        element.deleted = true;
        block.visible -= 1;
        self.visible -= 1;
        true
    }

    fn locate(&self, pos: usize) -> Option<(usize, usize)> {
        let mut remaining = pos;
        for (b, block) in self.blocks.iter().enumerate() {
            if remaining < block.elements.len() {
                return Some((b, remaining));
            }
            remaining -= block.elements.len();
        }
        None
    }

    fn split(&mut self, b: usize) {
        let key = self.block_index.len();
        let tail = self.blocks[b].elements.split_off(MAX_BLOCK_LEN / 2);
        let moved_visible = tail.iter().filter(|e| !e.deleted).count();
        self.blocks[b].visible -= moved_visible;
        for element in &tail {
            self.location.insert(element.id, key);
        }

        self.blocks.insert(
            b + 1,
            Block {
                key,
                elements: tail,
                visible: moved_visible,
            },
        );
        self.block_index.push(b + 1);
        for (i, block) in self.blocks.iter().enumerate().skip(b + 2) {
            self.block_index[block.key] = i;
        }
    }
}
