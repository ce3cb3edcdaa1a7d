use dynrec_x86::Width;

use super::{BlockId, CodeCache, PageId};
use crate::mem::{page_offset, read_phys, write_phys, GuestMemory, PageFault, PageFlags};
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Write-interception state for one guest physical page holding translated code.
pub struct CodePageMonitor {
    pub(crate) phys_page: u32,
    /// Attributes of the shadowed page.
    pub(crate) flags: PageFlags,
    /// Code size the page's blocks were translated for.
    pub(crate) code_big: bool,
    /// Per byte: number of live blocks whose guest range covers it.
    pub(crate) write_map: Box<[u16; PAGE_SIZE]>,
    /// Per byte: times it was overwritten while covered. Allocated on the first code hit.
    pub(crate) invalidation_map: Option<Box<[u8; PAGE_SIZE]>>,
    /// Blocks by `1 + (page_start >> hash_shift)`; bucket 0 holds cross-page companions.
    pub(crate) hash_map: Box<[Option<BlockId>]>,
    pub(crate) active_blocks: u32,
    /// Writes to code-free bytes left before a block-less page is released.
    pub(crate) active_count: u32,
    pub(crate) installed: bool,
    pub(crate) prev: Option<PageId>,
    pub(crate) next: Option<PageId>,
}

impl CodePageMonitor {
    pub(crate) fn new(buckets: usize) -> Self {
        Self {
            phys_page: 0,
            flags: PageFlags::empty(),
            code_big: false,
            write_map: Box::new([0; PAGE_SIZE]),
            invalidation_map: None,
            hash_map: vec![None; buckets].into_boxed_slice(),
            active_blocks: 0,
            active_count: 0,
            installed: false,
            prev: None,
            next: None,
        }
    }

    pub fn phys_page(&self) -> u32 {
        self.phys_page
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    pub fn code_big(&self) -> bool {
        self.code_big
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn write_map(&self) -> &[u16; PAGE_SIZE] {
        &self.write_map
    }

    pub fn invalidation_count(&self, offset: usize) -> u8 {
        self.invalidation_map.as_ref().map_or(0, |m| m[offset])
    }

    pub fn active_blocks(&self) -> u32 {
        self.active_blocks
    }

    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    fn has_code(&self, start: usize, len: usize) -> bool {
        self.write_map[start..start + len].iter().any(|&c| c != 0)
    }

    fn bump_invalidations(&mut self, start: usize, len: usize) {
        let map = self
            .invalidation_map
            .get_or_insert_with(|| Box::new([0; PAGE_SIZE]));
        for count in &mut map[start..start + len] {
            *count = count.saturating_add(1);
        }
    }
}

fn write_unmonitored<M: GuestMemory + ?Sized>(mem: &mut M, paddr: u32, width: Width, value: u32) {
    if !mem.page_flags(paddr >> PAGE_SHIFT).contains(PageFlags::ROM) {
        write_phys(mem, paddr, width, value);
    }
}

impl CodeCache {
    fn bucket_of(&self, offset: u16) -> usize {
        1 + (usize::from(offset) >> self.config.hash_shift)
    }

    /// Registers a freshly opened block starting at its `page_start`.
    pub(crate) fn add_cache_block(&mut self, page: PageId, id: BlockId) {
        let index = self.bucket_of(self.blocks[id.index()].page_start);
        self.push_hash(page, id, index);
    }

    /// Registers a cross-page companion (always in bucket 0).
    pub(crate) fn add_cross_block(&mut self, page: PageId, id: BlockId) {
        self.blocks[id.index()].page_start = 0;
        self.push_hash(page, id, 0);
    }

    fn push_hash(&mut self, page: PageId, id: BlockId, index: usize) {
        let monitor = &mut self.pages[page.index()];
        monitor.active_blocks += 1;
        let block = &mut self.blocks[id.index()];
        block.owner = Some(page);
        block.hash_index = index;
        block.hash_next = monitor.hash_map[index];
        monitor.hash_map[index] = Some(id);
    }

    /// Counts a guest byte as covered by the block being translated.
    pub(crate) fn cover_byte(&mut self, page: PageId, offset: usize) {
        let count = &mut self.pages[page.index()].write_map[offset];
        *count = count.wrapping_add(1);
    }

    /// Removes a dying block from its monitor: unhashes it and releases its write map cover.
    pub(crate) fn del_cache_block(&mut self, page: PageId, id: BlockId) {
        let release_delay = self.config.release_delay;
        let (index, start, end) = {
            let block = &mut self.blocks[id.index()];
            block.owner = None;
            (block.hash_index, block.page_start, block.page_end)
        };

        let monitor = &mut self.pages[page.index()];
        monitor.active_blocks = monitor.active_blocks.saturating_sub(1);
        monitor.active_count = release_delay;

        let mut prev: Option<BlockId> = None;
        let mut cur = monitor.hash_map[index];
        let mut found = false;
        while let Some(b) = cur {
            let next = self.blocks[b.index()].hash_next;
            if b == id {
                match prev {
                    None => monitor.hash_map[index] = next,
                    Some(p) => self.blocks[p.index()].hash_next = next,
                }
                found = true;
                break;
            }
            prev = Some(b);
            cur = next;
        }
        self.blocks[id.index()].hash_next = None;

        let block = &self.blocks[id.index()];
        for offset in start..=end {
            if !block.is_masked(offset) {
                let count = &mut monitor.write_map[usize::from(offset)];
                *count = count.saturating_sub(1);
            }
        }

        if !found {
            self.anomaly("block missing from its page hash", id);
        }
    }

    /// The block starting at page offset `start`, if one is cached.
    pub fn find_cache_block(&self, page: PageId, start: u16) -> Option<BlockId> {
        let mut cur = self.pages[page.index()].hash_map[self.bucket_of(start)];
        while let Some(b) = cur {
            let block = &self.blocks[b.index()];
            if block.page_start == start {
                return Some(b);
            }
            cur = block.hash_next;
        }
        None
    }

    /// Clears every block overlapping `[start, end]`.
    ///
    /// Buckets are walked from the one holding `end` down to bucket 0, stopping as soon as the
    /// write map shows no code left in the range. Returns whether `running`, or the block
    /// `running` is a cross-page companion of, was among the cleared blocks.
    pub fn invalidate_range(
        &mut self,
        page: PageId,
        start: usize,
        end: usize,
        running: Option<BlockId>,
    ) -> bool {
        let mut is_current = false;
        let mut index = self.bucket_of(end as u16) as isize;
        while index >= 0 {
            if !self.pages[page.index()].has_code(start, end - start + 1) {
                return is_current;
            }
            let mut cur = self.pages[page.index()].hash_map[index as usize];
            while let Some(b) = cur {
                let block = &self.blocks[b.index()];
                cur = block.hash_next;
                if usize::from(block.page_start) <= end && usize::from(block.page_end) >= start {
                    if running.is_some() && (Some(b) == running || block.cross == running) {
                        is_current = true;
                    }
                    self.clear_block(b);
                }
            }
            index -= 1;
        }
        is_current
    }

    /// Notes a store of `len` bytes at page offset `offset` that changed memory, and
    /// invalidates the blocks it hit. Returns whether `running` was hit.
    fn note_store(
        &mut self,
        page: PageId,
        offset: usize,
        len: usize,
        running: Option<BlockId>,
    ) -> bool {
        let monitor = &mut self.pages[page.index()];
        if !monitor.has_code(offset, len) {
            if monitor.active_blocks == 0 {
                monitor.active_count = monitor.active_count.saturating_sub(1);
                if monitor.active_count == 0 {
                    self.release(page);
                }
            }
            return false;
        }
        monitor.bump_invalidations(offset, len);
        self.invalidate_range(page, offset, offset + len - 1, running)
    }

    /// Plain store into guest physical memory, as done by the interpreter or devices.
    ///
    /// ROM pages drop the store and unchanged values are skipped. Otherwise memory is written
    /// first, then any block covering the written bytes is invalidated. The access must not
    /// cross a page boundary.
    pub fn write<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        paddr: u32,
        width: Width,
        value: u32,
    ) {
        let Some(page) = self.page_for_phys(paddr >> PAGE_SHIFT) else {
            write_unmonitored(mem, paddr, width, value);
            return;
        };
        if self.pages[page.index()].flags.contains(PageFlags::ROM) {
            return;
        }
        if read_phys(mem, paddr, width) == value & width.mask() {
            return;
        }
        write_phys(mem, paddr, width, value);
        let phys_page = self.pages[page.index()].phys_page;
        self.note_store(page, page_offset(paddr), width.bytes() as usize, None);
        if !self.pages[page.index()].installed {
            mem.code_page_released(phys_page);
        }
    }

    /// Store performed by translated code.
    ///
    /// Invalidation runs before memory is touched. If the block `running` is hit the store is
    /// withheld and `true` is returned; the caller must leave the block so the instruction can be
    /// replayed by the interpreter.
    pub fn write_checked<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        paddr: u32,
        width: Width,
        value: u32,
        running: Option<BlockId>,
    ) -> bool {
        let Some(page) = self.page_for_phys(paddr >> PAGE_SHIFT) else {
            write_unmonitored(mem, paddr, width, value);
            return false;
        };
        if self.pages[page.index()].flags.contains(PageFlags::ROM) {
            return false;
        }
        if read_phys(mem, paddr, width) == value & width.mask() {
            return false;
        }
        let phys_page = self.pages[page.index()].phys_page;
        if self.note_store(page, page_offset(paddr), width.bytes() as usize, running) {
            return true;
        }
        if !self.pages[page.index()].installed {
            mem.code_page_released(phys_page);
        }
        write_phys(mem, paddr, width, value);
        false
    }

    /// Stops shadowing a page; its monitor returns to the pool.
    pub(crate) fn release(&mut self, page: PageId) {
        let (phys_page, prev, next) = {
            let m = &mut self.pages[page.index()];
            m.installed = false;
            m.invalidation_map = None;
            (m.phys_page, m.prev.take(), m.next.take())
        };
        match prev {
            Some(p) => self.pages[p.index()].next = next,
            None => self.used_head = next,
        }
        match next {
            Some(n) => self.pages[n.index()].prev = prev,
            None => self.used_tail = prev,
        }
        self.by_phys.remove(&phys_page);
        self.free_pages.push(page);
        self.stats.pages_released += 1;
        tracing::debug!(
            phys_page = format_args!("{phys_page:#x}"),
            "released code page"
        );
    }

    /// Clears every block of the page, then releases it.
    pub fn clear_release(&mut self, page: PageId) {
        for index in 0..self.pages[page.index()].hash_map.len() {
            let mut cur = self.pages[page.index()].hash_map[index].take();
            while let Some(b) = cur {
                cur = self.blocks[b.index()].hash_next.take();
                // Whole page goes away; skip per-block write map bookkeeping.
                self.blocks[b.index()].owner = None;
                self.clear_block(b);
            }
        }
        let monitor = &mut self.pages[page.index()];
        monitor.active_blocks = 0;
        monitor.write_map.fill(0);
        self.release(page);
    }

    fn install_page(
        &mut self,
        phys_page: u32,
        flags: PageFlags,
        code_big: bool,
        protect: Option<PageId>,
    ) -> (PageId, Option<u32>) {
        let mut recycled = None;
        let page = match self.free_pages.pop() {
            Some(page) => page,
            None => {
                // Recycle the least recently installed page, never the one being translated.
                let mut victim = self.used_tail;
                if victim.is_some() && victim == protect {
                    victim = victim.and_then(|v| self.pages[v.index()].prev);
                }
                let victim = victim.unwrap_or_else(|| {
                    unreachable!("code page pool exhausted with fewer than two pages in use")
                });
                recycled = Some(self.pages[victim.index()].phys_page);
                self.clear_release(victim);
                self.free_pages
                    .pop()
                    .unwrap_or_else(|| unreachable!("released page not returned to the pool"))
            }
        };

        let old_head = self.used_head;
        let monitor = &mut self.pages[page.index()];
        monitor.phys_page = phys_page;
        monitor.flags = flags;
        monitor.code_big = code_big;
        monitor.write_map.fill(0);
        monitor.invalidation_map = None;
        monitor.hash_map.fill(None);
        monitor.active_blocks = 0;
        monitor.active_count = self.config.release_delay;
        monitor.installed = true;
        monitor.prev = None;
        monitor.next = old_head;
        match old_head {
            Some(h) => self.pages[h.index()].prev = Some(page),
            None => self.used_tail = Some(page),
        }
        self.used_head = Some(page);
        self.by_phys.insert(phys_page, page);
        self.stats.pages_installed += 1;
        tracing::debug!(
            phys_page = format_args!("{phys_page:#x}"),
            code_big,
            "installed code page"
        );
        (page, recycled)
    }

    /// Finds or installs the monitor for the page holding linear address `linear`.
    ///
    /// Returns `Ok(None)` for pages that must not hold translated code. A page installed for the
    /// other code size is cleared and reinstalled. `protect` is never recycled to make room.
    pub fn make_code_page<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        linear: u32,
        code_big: bool,
        protect: Option<PageId>,
    ) -> Result<Option<PageId>, PageFault> {
        let phys_page = mem.translate(linear, false)? >> PAGE_SHIFT;
        if let Some(page) = self.page_for_phys(phys_page) {
            if self.pages[page.index()].code_big == code_big {
                return Ok(Some(page));
            }
            self.clear_release(page);
            mem.code_page_released(phys_page);
        }

        let flags = mem.page_flags(phys_page);
        if !flags.contains(PageFlags::READABLE) || flags.contains(PageFlags::NO_CODE) {
            return Ok(None);
        }
        let (page, recycled) = self.install_page(phys_page, flags, code_big, protect);
        if let Some(old) = recycled {
            mem.code_page_released(old);
        }
        Ok(Some(page))
    }

    /// Whether a block starting at this page offset should be interpreted rather than
    /// translated, because the guest keeps rewriting the byte.
    pub fn is_heavily_rewritten(&self, page: PageId, offset: usize) -> bool {
        self.pages[page.index()].invalidation_count(offset) >= self.config.heavy_rewrite_threshold
    }
}
