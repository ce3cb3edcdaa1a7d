//! Arena span allocation.
//!
//! Spans are laid out back to back in arena order (`arena_next`). `open_block` takes the span at
//! the allocator cursor and grows it over its successors until it can hold `max_block_size`
//! bytes; `close_block` trims it to what was emitted and advances the cursor, wrapping back to
//! the first span near the end of the arena. Whatever lived in a span that gets reused is cleared
//! first, so the cache recycles its oldest translations in arena order.

use super::{BlockId, CodeCache};
use crate::error::DynrecError;

impl CodeCache {
    /// Pops a descriptor from the free list.
    pub(crate) fn get_free_block(&mut self) -> Result<BlockId, DynrecError> {
        let id = self.free_head.ok_or(DynrecError::OutOfBlocks)?;
        let block = &mut self.blocks[id.index()];
        self.free_head = block.free_next.take();
        *block = Default::default();
        Ok(id)
    }

    pub(crate) fn push_free(&mut self, id: BlockId) {
        self.blocks[id.index()].free_next = self.free_head;
        self.free_head = Some(id);
    }

    /// Opens the span at the allocator cursor for a new translation.
    pub fn open_block(&mut self) -> BlockId {
        let id = self.active;
        debug_assert!(self.open.is_none(), "{:?} still open", self.open);

        if self.blocks[id.index()].is_live() {
            self.clear_block(id);
        }
        let mut size = self.blocks[id.index()].code_size;
        let mut next = self.blocks[id.index()].arena_next;
        while size < self.config.max_block_size {
            let Some(n) = next else { break };
            size += self.blocks[n.index()].code_size;
            next = self.blocks[n.index()].arena_next;
            if self.blocks[n.index()].is_live() {
                self.clear_block(n);
            }
            self.push_free(n);
        }

        let block = &mut self.blocks[id.index()];
        block.code_size = size;
        block.arena_next = next;
        block.mask = None;
        block.cross = None;
        block.hash_next = None;
        self.open = Some(id);
        self.stats.blocks_opened += 1;
        id
    }

    /// Bytes the open block may emit: its span, plus the arena slack when it is the last span.
    pub fn block_capacity(&self, id: BlockId) -> usize {
        let block = &self.blocks[id.index()];
        match block.arena_next {
            Some(_) => block.code_size,
            None => block.code_size + self.config.max_block_size,
        }
    }

    /// Seals the open block after `written` bytes of host code were emitted into it.
    pub fn close_block(&mut self, written: usize) -> Result<BlockId, DynrecError> {
        let id = self
            .open
            .take()
            .unwrap_or_else(|| unreachable!("close_block without an open block"));
        let capacity = self.block_capacity(id);
        if written > capacity {
            return Err(DynrecError::Overrun { written, capacity });
        }

        let align = self.config.align;
        let (code_start, code_size, arena_next) = {
            let block = &self.blocks[id.index()];
            (block.code_start, block.code_size, block.arena_next)
        };
        if code_size > written && code_size - written > align {
            let new_size = ((written.max(1) - 1) | (align - 1)) + 1;
            let split = self.get_free_block()?;
            let rest = &mut self.blocks[split.index()];
            rest.code_start = code_start + new_size;
            rest.code_size = code_size - new_size;
            rest.arena_next = arena_next;
            rest.hash_index = 1;
            let block = &mut self.blocks[id.index()];
            block.arena_next = Some(split);
            block.code_size = new_size;
        }

        let wrap_at = self.blocks_start + self.config.cache_size - self.config.max_block_size;
        self.active = match self.blocks[id.index()].arena_next {
            Some(next) if self.blocks[next.index()].code_start <= wrap_at => next,
            _ => {
                self.stats.wraps += 1;
                tracing::debug!(wraps = self.stats.wraps, "code cache cursor wrapped");
                self.first
            }
        };
        Ok(id)
    }

    /// Gives up on the open block, e.g. after an emission error.
    pub(crate) fn abandon_block(&mut self) {
        if let Some(id) = self.open.take() {
            if self.blocks[id.index()].is_live() {
                self.clear_block(id);
            }
        }
    }
}
