//! Guest memory seen by the dynamic core.
//!
//! [`GuestMemory`] is the physical side (raw RAM/ROM access, paging, page attributes) provided by
//! the embedding machine. [`GuestBus`] is the linear, exception-reporting view handed to the
//! interpreter; inside the core it is implemented by [`crate::CodeBus`] so that stores made by
//! the interpreter are seen by the code page monitors.

use std::collections::BTreeSet;

use bitflags::bitflags;
use dynrec_x86::Width;

use crate::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

bitflags! {
    /// Attributes of a physical page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u8 {
        const READABLE = 1 << 0;
        const WRITEABLE = 1 << 1;
        /// Writes are discarded.
        const ROM = 1 << 2;
        /// Never translate code from this page (MMIO, bank-switched windows, ...).
        const NO_CODE = 1 << 3;
    }
}

impl PageFlags {
    pub const RAM: PageFlags = PageFlags::READABLE.union(PageFlags::WRITEABLE);
}

/// A not-present or protection page fault raised while translating a linear address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub linear: u32,
    /// Architectural `#PF` error code (bit 0 present, bit 1 write).
    pub error_code: u32,
}

impl PageFault {
    pub const ERR_PRESENT: u32 = 1 << 0;
    pub const ERR_WRITE: u32 = 1 << 1;

    pub fn not_present(linear: u32, write: bool) -> Self {
        Self {
            linear,
            error_code: if write { Self::ERR_WRITE } else { 0 },
        }
    }
}

/// Physical memory and paging of the emulated machine.
pub trait GuestMemory {
    /// Translates a linear address to a physical address.
    fn translate(&mut self, linear: u32, write: bool) -> Result<u32, PageFault>;

    /// Attributes of physical page `phys_page` (physical address `>> 12`).
    fn page_flags(&self, phys_page: u32) -> PageFlags;

    fn read_u8(&self, paddr: u32) -> u8;

    /// Raw store; ROM handling is done by the caller.
    fn write_u8(&mut self, paddr: u32, value: u8);

    fn read_u16(&self, paddr: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(paddr), self.read_u8(paddr.wrapping_add(1))])
    }

    fn read_u32(&self, paddr: u32) -> u32 {
        u32::from_le_bytes([
            self.read_u8(paddr),
            self.read_u8(paddr.wrapping_add(1)),
            self.read_u8(paddr.wrapping_add(2)),
            self.read_u8(paddr.wrapping_add(3)),
        ])
    }

    fn write_u16(&mut self, paddr: u32, value: u16) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u32), b);
        }
    }

    fn write_u32(&mut self, paddr: u32, value: u32) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u32), b);
        }
    }

    /// Direct view of a readable page, used to fetch instruction bytes without per-byte calls.
    fn host_page(&self, _phys_page: u32) -> Option<&[u8; PAGE_SIZE]> {
        None
    }

    /// A code page monitor stopped shadowing `phys_page`; cached write routing for it is stale.
    fn code_page_released(&mut self, _phys_page: u32) {}
}

pub(crate) fn read_phys<M: GuestMemory + ?Sized>(mem: &M, paddr: u32, width: Width) -> u32 {
    match width {
        Width::W8 => u32::from(mem.read_u8(paddr)),
        Width::W16 => u32::from(mem.read_u16(paddr)),
        Width::W32 => mem.read_u32(paddr),
    }
}

pub(crate) fn write_phys<M: GuestMemory + ?Sized>(
    mem: &mut M,
    paddr: u32,
    width: Width,
    value: u32,
) {
    match width {
        Width::W8 => mem.write_u8(paddr, value as u8),
        Width::W16 => mem.write_u16(paddr, value as u16),
        Width::W32 => mem.write_u32(paddr, value),
    }
}

/// Linear guest memory as seen by an instruction: faults are reported, not delivered.
pub trait GuestBus {
    fn read_u8(&mut self, linear: u32) -> Result<u8, PageFault>;
    fn write_u8(&mut self, linear: u32, value: u8) -> Result<(), PageFault>;

    fn read(&mut self, linear: u32, width: Width) -> Result<u32, PageFault> {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().take(width.bytes() as usize).enumerate() {
            *b = self.read_u8(linear.wrapping_add(i as u32))?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    fn write(&mut self, linear: u32, width: Width, value: u32) -> Result<(), PageFault> {
        for (i, b) in value
            .to_le_bytes()
            .into_iter()
            .take(width.bytes() as usize)
            .enumerate()
        {
            self.write_u8(linear.wrapping_add(i as u32), b)?;
        }
        Ok(())
    }
}

/// Identity-mapped RAM with per-page attributes, for tests and simple embedders.
///
/// Reads outside RAM return `0xFF`, writes outside RAM are dropped. Linear pages can be marked
/// not-present to exercise fault delivery.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    ram: Vec<u8>,
    flags: Vec<PageFlags>,
    not_present: BTreeSet<u32>,
    released_pages: Vec<u32>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        let pages = size.div_ceil(PAGE_SIZE);
        Self {
            ram: vec![0; pages * PAGE_SIZE],
            flags: vec![PageFlags::RAM; pages],
            not_present: BTreeSet::new(),
            released_pages: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ram.is_empty()
    }

    /// Copies `bytes` to physical address `paddr`, bypassing ROM attributes.
    pub fn load(&mut self, paddr: u32, bytes: &[u8]) {
        let start = paddr as usize;
        self.ram[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn bytes(&self, paddr: u32, len: usize) -> &[u8] {
        &self.ram[paddr as usize..paddr as usize + len]
    }

    pub fn set_page_flags(&mut self, phys_page: u32, flags: PageFlags) {
        self.flags[phys_page as usize] = flags;
    }

    pub fn set_present(&mut self, linear_page: u32, present: bool) {
        if present {
            self.not_present.remove(&linear_page);
        } else {
            self.not_present.insert(linear_page);
        }
    }

    /// Pages reported through [`GuestMemory::code_page_released`], oldest first.
    pub fn released_pages(&self) -> &[u32] {
        &self.released_pages
    }
}

impl GuestMemory for FlatMemory {
    fn translate(&mut self, linear: u32, write: bool) -> Result<u32, PageFault> {
        if self.not_present.contains(&(linear >> PAGE_SHIFT)) {
            return Err(PageFault::not_present(linear, write));
        }
        Ok(linear)
    }

    fn page_flags(&self, phys_page: u32) -> PageFlags {
        self.flags
            .get(phys_page as usize)
            .copied()
            .unwrap_or(PageFlags::NO_CODE)
    }

    fn read_u8(&self, paddr: u32) -> u8 {
        self.ram.get(paddr as usize).copied().unwrap_or(0xFF)
    }

    fn write_u8(&mut self, paddr: u32, value: u8) {
        if let Some(slot) = self.ram.get_mut(paddr as usize) {
            *slot = value;
        }
    }

    fn host_page(&self, phys_page: u32) -> Option<&[u8; PAGE_SIZE]> {
        let start = (phys_page as usize).checked_mul(PAGE_SIZE)?;
        self.ram.get(start..start + PAGE_SIZE)?.try_into().ok()
    }

    fn code_page_released(&mut self, phys_page: u32) {
        self.released_pages.push(phys_page);
    }
}

/// Offset of `paddr` within its page.
pub(crate) const fn page_offset(addr: u32) -> usize {
    (addr & PAGE_MASK) as usize
}
