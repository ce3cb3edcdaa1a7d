use std::fmt;

/// Handle of a cache block descriptor in the fixed pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Inverse of [`Self::raw`]; `u32::MAX` encodes "no block".
    pub(crate) const fn from_raw(raw: u32) -> Option<Self> {
        if raw == u32::MAX {
            None
        } else {
            Some(Self(raw))
        }
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

/// Handle of a code page monitor in the fixed pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u32);

impl PageId {
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({})", self.0)
    }
}

/// Where a link slot currently jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget {
    /// The slot's exit stub, which returns `Link1`/`Link2` to the dispatcher.
    Exit,
    Block(BlockId),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkSlot {
    pub(crate) to: LinkTarget,
    /// Next block in `to`'s from-chain for this slot.
    pub(crate) next: Option<BlockId>,
    /// Head of the chain of blocks whose slot jumps here.
    pub(crate) from: Option<BlockId>,
}

impl LinkSlot {
    const UNLINKED: LinkSlot = LinkSlot {
        to: LinkTarget::Exit,
        next: None,
        from: None,
    };
}

/// Guest bytes a block reads at run time rather than baking into host code. They are not
/// counted in the page's write map, so rewriting them does not invalidate the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WriteMask {
    start: u16,
    bits: Vec<u8>,
}

impl WriteMask {
    pub(crate) fn new(start: u16, len: usize) -> Self {
        Self {
            start,
            bits: vec![0; len],
        }
    }

    /// Marks page offset `offset`, growing the mask by `growth` when it falls past the end.
    pub(crate) fn mark(&mut self, offset: u16, growth: usize) {
        let rel = usize::from(offset.saturating_sub(self.start));
        if rel >= self.bits.len() {
            let new_len = (self.bits.len() * growth).max(rel + 1);
            self.bits.resize(new_len, 0);
        }
        self.bits[rel] = 1;
    }

    pub(crate) fn contains(&self, offset: u16) -> bool {
        offset >= self.start
            && self
                .bits
                .get(usize::from(offset - self.start))
                .is_some_and(|&b| b != 0)
    }

    pub(crate) fn len(&self) -> usize {
        self.bits.len()
    }
}

/// One translated unit of guest code.
#[derive(Debug, Clone)]
pub struct CacheBlock {
    /// First guest byte, as an offset in the owning page.
    pub(crate) page_start: u16,
    /// Last guest byte (inclusive).
    pub(crate) page_end: u16,
    pub(crate) owner: Option<PageId>,

    /// Arena offset of the block's host code span.
    pub(crate) code_start: usize,
    pub(crate) code_size: usize,
    /// Next span in arena order.
    pub(crate) arena_next: Option<BlockId>,
    pub(crate) free_next: Option<BlockId>,

    pub(crate) mask: Option<WriteMask>,
    pub(crate) links: [LinkSlot; 2],

    /// Bucket in the owner's hash; 0 marks a cross-page companion.
    pub(crate) hash_index: usize,
    pub(crate) hash_next: Option<BlockId>,
    pub(crate) cross: Option<BlockId>,
}

impl Default for CacheBlock {
    fn default() -> Self {
        Self {
            page_start: 0,
            page_end: 0,
            owner: None,
            code_start: 0,
            code_size: 0,
            arena_next: None,
            free_next: None,
            mask: None,
            links: [LinkSlot::UNLINKED; 2],
            hash_index: 0,
            hash_next: None,
            cross: None,
        }
    }
}

impl CacheBlock {
    /// Inclusive guest byte range inside the owning page.
    pub fn page_range(&self) -> (u16, u16) {
        (self.page_start, self.page_end)
    }

    pub fn owner(&self) -> Option<PageId> {
        self.owner
    }

    pub fn is_live(&self) -> bool {
        self.owner.is_some()
    }

    pub fn is_cross(&self) -> bool {
        self.hash_index == 0
    }

    pub fn cross_block(&self) -> Option<BlockId> {
        self.cross
    }

    /// Arena offset and length of the host code span.
    pub fn code_span(&self) -> (usize, usize) {
        (self.code_start, self.code_size)
    }

    pub fn arena_next(&self) -> Option<BlockId> {
        self.arena_next
    }

    pub fn link_target(&self, slot: usize) -> LinkTarget {
        self.links[slot].to
    }

    /// Whether guest offset `offset` is read at run time instead of being watched.
    pub fn is_masked(&self, offset: u16) -> bool {
        self.mask.as_ref().is_some_and(|m| m.contains(offset))
    }

    pub fn mask_len(&self) -> usize {
        self.mask.as_ref().map_or(0, WriteMask::len)
    }
}
