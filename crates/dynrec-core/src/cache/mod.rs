//! The code cache: block descriptors, their arena spans, links and the code page monitors.
//!
//! Everything lives in fixed pools allocated up front and is addressed by index handles
//! ([`BlockId`], [`PageId`]). Free lists, hash chains and link chains are intrusive index chains
//! inside the descriptors, so steady-state operation does not allocate.

mod alloc;
mod block;
mod page;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub use block::{BlockId, CacheBlock, LinkTarget, PageId};
pub use page::CodePageMonitor;

use crate::config::DynrecConfig;

pub(crate) use block::WriteMask;

/// Counters for cache-internal events.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub blocks_opened: u64,
    pub blocks_cleared: u64,
    pub links_made: u64,
    /// Times the allocator cursor wrapped back to the first span.
    pub wraps: u64,
    pub pages_installed: u64,
    pub pages_released: u64,
    /// Bookkeeping inconsistencies that were logged and skipped.
    pub anomalies: u64,
}

pub struct CodeCache {
    config: DynrecConfig,

    blocks: Vec<CacheBlock>,
    free_head: Option<BlockId>,
    /// First span in arena order.
    first: BlockId,
    /// Span the next `open_block` starts from.
    active: BlockId,
    /// Block currently opened for translation.
    open: Option<BlockId>,
    blocks_start: usize,

    arena_base: usize,
    /// Two host code addresses per block; translated code jumps through them. Unlinked entries
    /// hold the slot's exit stub. Shared so generated code can read it while the cache is
    /// borrowed by the runtime helpers.
    link_table: Arc<[AtomicUsize]>,
    exit_stubs: [usize; 2],

    pages: Vec<CodePageMonitor>,
    free_pages: Vec<PageId>,
    /// Installed monitors, most recently installed first.
    used_head: Option<PageId>,
    used_tail: Option<PageId>,
    by_phys: HashMap<u32, PageId>,

    stats: CacheStats,
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("blocks", &self.blocks.len())
            .field("active", &self.active)
            .field("pages_in_use", &self.by_phys.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl CodeCache {
    /// Builds the pools. The whole block area `[blocks_start, blocks_start + cache_size)` starts
    /// out as one span.
    pub fn new(
        config: &DynrecConfig,
        arena_base: usize,
        blocks_start: usize,
        exit_stubs: [usize; 2],
    ) -> Self {
        let mut blocks = vec![CacheBlock::default(); config.block_count];
        // Descriptor 0 is the initial span; the rest form the free list.
        for (i, block) in blocks.iter_mut().enumerate().skip(1) {
            block.free_next = (i + 1 < config.block_count).then(|| BlockId::from_index(i + 1));
        }
        blocks[0].code_start = blocks_start;
        blocks[0].code_size = config.cache_size;
        blocks[0].hash_index = 1;

        let link_table = (0..config.block_count * 2)
            .map(|i| AtomicUsize::new(exit_stubs[i % 2]))
            .collect();

        let pages = (0..config.code_pages)
            .map(|_| CodePageMonitor::new(config.hash_buckets()))
            .collect();
        let free_pages = (0..config.code_pages)
            .rev()
            .map(PageId::from_index)
            .collect();

        Self {
            config: *config,
            blocks,
            free_head: (config.block_count > 1).then(|| BlockId::from_index(1)),
            first: BlockId::from_index(0),
            active: BlockId::from_index(0),
            open: None,
            blocks_start,
            arena_base,
            link_table,
            exit_stubs,
            pages,
            free_pages,
            used_head: None,
            used_tail: None,
            by_phys: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn config(&self) -> &DynrecConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn block(&self, id: BlockId) -> &CacheBlock {
        &self.blocks[id.index()]
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut CacheBlock {
        &mut self.blocks[id.index()]
    }

    /// Marks page offset `offset` of `id` as read at run time.
    pub(crate) fn mask_byte(&mut self, id: BlockId, offset: u16) {
        let (initial, growth) = (self.config.mask_initial_len, self.config.mask_growth);
        let block = &mut self.blocks[id.index()];
        let start = block.page_start;
        block
            .mask
            .get_or_insert_with(|| WriteMask::new(start, initial))
            .mark(offset, growth);
    }

    pub fn page(&self, id: PageId) -> &CodePageMonitor {
        &self.pages[id.index()]
    }

    /// The monitor shadowing physical page `phys_page`, if any.
    pub fn page_for_phys(&self, phys_page: u32) -> Option<PageId> {
        self.by_phys.get(&phys_page).copied()
    }

    /// Installed monitors, most recently installed first.
    pub fn used_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        std::iter::successors(self.used_head, move |p| self.pages[p.index()].next)
    }

    /// Host address of a block's first instruction.
    pub fn code_addr(&self, id: BlockId) -> usize {
        self.arena_base + self.blocks[id.index()].code_start
    }

    /// Address of the link table entry for `slot` of `id`.
    pub(crate) fn link_entry_addr(&self, id: BlockId, slot: usize) -> usize {
        std::ptr::from_ref(&self.link_table[id.index() * 2 + slot]) as usize
    }

    /// Current jump target of `slot` of `id`.
    pub fn link_entry(&self, id: BlockId, slot: usize) -> usize {
        self.link_table[id.index() * 2 + slot].load(Ordering::Relaxed)
    }

    pub fn exit_stub(&self, slot: usize) -> usize {
        self.exit_stubs[slot]
    }

    /// Blocks in arena order, starting from the first span.
    pub fn spans(&self) -> impl Iterator<Item = BlockId> + '_ {
        std::iter::successors(Some(self.first), move |b| self.blocks[b.index()].arena_next)
    }

    /// Span the next `open_block` will start from.
    pub fn active_cursor(&self) -> BlockId {
        self.active
    }

    fn anomaly(&mut self, what: &str, block: BlockId) {
        self.stats.anomalies += 1;
        tracing::error!(?block, "cache anomaly: {what}");
    }

    /// Links `slot` of `from` to `to`, so `from` jumps straight into `to` from now on.
    pub fn link(&mut self, from: BlockId, slot: usize, to: BlockId) {
        debug_assert_eq!(
            self.blocks[from.index()].links[slot].to,
            LinkTarget::Exit,
            "linking an already linked slot"
        );
        let head = self.blocks[to.index()].links[slot].from;
        let link = &mut self.blocks[from.index()].links[slot];
        link.to = LinkTarget::Block(to);
        link.next = head;
        self.blocks[to.index()].links[slot].from = Some(from);
        let target = self.code_addr(to);
        self.link_table[from.index() * 2 + slot].store(target, Ordering::Relaxed);
        self.stats.links_made += 1;
    }

    /// Blocks whose `slot` jumps into `id`.
    pub fn link_sources(&self, id: BlockId, slot: usize) -> Vec<BlockId> {
        std::iter::successors(self.blocks[id.index()].links[slot].from, |b| {
            self.blocks[b.index()].links[slot].next
        })
        .collect()
    }

    fn reset_link(&mut self, id: BlockId, slot: usize) {
        let link = &mut self.blocks[id.index()].links[slot];
        link.to = LinkTarget::Exit;
        link.next = None;
        self.link_table[id.index() * 2 + slot].store(self.exit_stubs[slot], Ordering::Relaxed);
    }

    /// Removes `id` from `target`'s from-chain for `slot`.
    fn unlink_from(&mut self, target: BlockId, slot: usize, id: BlockId) {
        let mut prev: Option<BlockId> = None;
        let mut cur = self.blocks[target.index()].links[slot].from;
        while let Some(b) = cur {
            let next = self.blocks[b.index()].links[slot].next;
            if b == id {
                match prev {
                    None => self.blocks[target.index()].links[slot].from = next,
                    Some(p) => self.blocks[p.index()].links[slot].next = next,
                }
                return;
            }
            prev = Some(b);
            cur = next;
        }
        self.anomaly("block missing from its link target's chain", id);
    }

    /// Tears down a block: unlinks it in both directions, clears its cross-page companion and
    /// returns its guest range to the owning monitor.
    pub fn clear_block(&mut self, id: BlockId) {
        self.stats.blocks_cleared += 1;
        if !self.blocks[id.index()].is_cross() {
            for slot in 0..2 {
                // Predecessors fall back to their exit stubs.
                let mut from = self.blocks[id.index()].links[slot].from.take();
                while let Some(pred) = from {
                    from = self.blocks[pred.index()].links[slot].next;
                    self.reset_link(pred, slot);
                }
                if let LinkTarget::Block(target) = self.blocks[id.index()].links[slot].to {
                    self.unlink_from(target, slot, id);
                }
                self.reset_link(id, slot);
            }
        } else {
            self.push_free(id);
        }

        if let Some(cross) = self.blocks[id.index()].cross.take() {
            self.blocks[cross.index()].cross = None;
            self.clear_block(cross);
        }
        if let Some(page) = self.blocks[id.index()].owner {
            self.del_cache_block(page, id);
        }
        self.blocks[id.index()].mask = None;
    }

    /// Clears every block and releases every page monitor.
    pub fn clear_all(&mut self) {
        while let Some(page) = self.used_head {
            self.clear_release(page);
        }
    }
}
