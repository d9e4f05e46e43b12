// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::collections::VecDeque;

use tracing::{
    debug,
    warn,
};

use crate::errs::{
    Result,
    TridentError,
};

pub(crate) type BlockId = usize;

#[derive(Debug)]
struct Block<K> {
    key: K,
    bytes: usize,
    locks: u32,
}

/// Accounts for resident blocks (mapped files, decompressed pages) against a
/// byte budget. Blocks are evicted oldest-first; a block with outstanding locks
/// is skipped by the eviction scan and stays resident even when that pushes the
/// manager over budget.
///
/// The manager never owns the memory itself. Evicted keys are handed back to
/// the caller, which releases whatever they stand for.
#[derive(Debug)]
pub(crate) struct MemoryManager<K> {
    budget: usize,
    max_blocks: usize,
    used: usize,
    slots: Vec<Option<Block<K>>>,
    free: Vec<BlockId>,
    order: VecDeque<BlockId>,
}

impl<K> MemoryManager<K> {
    pub(crate) fn new(budget: usize, max_blocks: usize) -> Self {
        Self {
            budget,
            max_blocks: max_blocks.max(1),
            used: 0,
            slots: Vec::new(),
            free: Vec::new(),
            order: VecDeque::new(),
        }
    }

    /// Registers a block of `bytes` bytes. Returns its id plus every key that
    /// had to be evicted to make room.
    pub(crate) fn add(&mut self, bytes: usize, key: K) -> Result<(BlockId, Vec<K>)> {
        let mut evicted = Vec::new();

        let mut i = 0;
        while self.used + bytes > self.budget && i < self.order.len() {
            let id = self.order[i];
            if self.is_used(id) {
                i += 1;
                continue;
            }
            self.order.remove(i);
            if let Some(k) = self.evict(id) {
                evicted.push(k);
            }
        }
        if self.used + bytes > self.budget {
            warn!(
                used = self.used,
                budget = self.budget,
                "every resident block is locked, exceeding the memory budget"
            );
        }

        if self.order.len() >= self.max_blocks {
            let pos = self
                .order
                .iter()
                .position(|id| !self.is_used(*id))
                .ok_or_else(|| {
                    TridentError::exhausted(format!(
                        "all {} memory block slots are locked",
                        self.max_blocks
                    ))
                })?;
            if let Some(id) = self.order.remove(pos) {
                if let Some(k) = self.evict(id) {
                    evicted.push(k);
                }
            }
        }

        let block = Block {
            key,
            bytes,
            locks: 0,
        };
        let id = match self.free.pop() {
            | Some(id) => {
                self.slots[id] = Some(block);
                id
            },
            | None => {
                self.slots.push(Some(block));
                self.slots.len() - 1
            },
        };
        self.order.push_back(id);
        self.used += bytes;
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), used = self.used, "evicted blocks");
        }
        Ok((id, evicted))
    }

    fn evict(&mut self, id: BlockId) -> Option<K> {
        let block = self.slots.get_mut(id)?.take()?;
        self.used -= block.bytes;
        self.free.push(id);
        Some(block.key)
    }

    pub(crate) fn add_lock(&mut self, id: BlockId) {
        if let Some(Some(b)) = self.slots.get_mut(id) {
            b.locks += 1;
        }
    }

    pub(crate) fn release_lock(&mut self, id: BlockId) -> Result<()> {
        match self.slots.get_mut(id) {
            | Some(Some(b)) if b.locks > 0 => {
                b.locks -= 1;
                Ok(())
            },
            | _ => Err(TridentError::misuse(format!(
                "releasing block {id} which holds no lock"
            ))),
        }
    }

    #[inline]
    pub(crate) fn is_used(&self, id: BlockId) -> bool {
        matches!(self.slots.get(id), Some(Some(b)) if b.locks > 0)
    }

    pub(crate) fn contains(&self, id: BlockId) -> bool {
        matches!(self.slots.get(id), Some(Some(_)))
    }

    pub(crate) fn key(&self, id: BlockId) -> Option<&K> {
        self.slots.get(id)?.as_ref().map(|b| &b.key)
    }

    /// Adjusts the accounted size of a resident block.
    pub(crate) fn update(&mut self, id: BlockId, bytes: usize) {
        if let Some(Some(b)) = self.slots.get_mut(id) {
            self.used = self.used - b.bytes + bytes;
            b.bytes = bytes;
        }
    }

    /// Drops a block regardless of its locks and hands its key back.
    pub(crate) fn remove_block(&mut self, id: BlockId) -> Option<K> {
        self.order.retain(|x| *x != id);
        self.evict(id)
    }

    pub(crate) fn bytes_used(&self) -> usize {
        self.used
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}
