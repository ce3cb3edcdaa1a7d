use dynrec_x86::Width;

use crate::cache::CodeCache;
use crate::mem::{read_phys, write_phys, GuestBus, GuestMemory, PageFault, PageFlags};
use crate::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Linear view of guest memory whose stores go through the code page monitors.
///
/// This is the bus handed to the interpreter and to exception delivery, and the one embedders
/// should use for device writes into RAM: every store that lands on a page holding translated
/// code invalidates the blocks it overlaps. Accesses crossing a page boundary are split; both
/// pages are translated before any byte is written, so a fault leaves memory untouched.
pub struct CodeBus<'a, M: GuestMemory + ?Sized> {
    mem: &'a mut M,
    cache: Option<&'a mut CodeCache>,
}

impl<'a, M: GuestMemory + ?Sized> CodeBus<'a, M> {
    pub fn new(mem: &'a mut M, cache: &'a mut CodeCache) -> Self {
        Self {
            mem,
            cache: Some(cache),
        }
    }

    /// A bus over plain memory, for when the dynamic core is disabled.
    pub fn unmonitored(mem: &'a mut M) -> Self {
        Self { mem, cache: None }
    }

    fn store(&mut self, paddr: u32, width: Width, value: u32) {
        match self.cache.as_deref_mut() {
            Some(cache) => cache.write(&mut *self.mem, paddr, width, value),
            None => {
                let flags = self.mem.page_flags(paddr >> PAGE_SHIFT);
                if !flags.contains(PageFlags::ROM) {
                    write_phys(&mut *self.mem, paddr, width, value);
                }
            }
        }
    }

    fn fits_in_page(linear: u32, width: Width) -> bool {
        (linear & PAGE_MASK) as usize + width.bytes() as usize <= PAGE_SIZE
    }
}

impl<M: GuestMemory + ?Sized> GuestBus for CodeBus<'_, M> {
    fn read_u8(&mut self, linear: u32) -> Result<u8, PageFault> {
        let paddr = self.mem.translate(linear, false)?;
        Ok(self.mem.read_u8(paddr))
    }

    fn write_u8(&mut self, linear: u32, value: u8) -> Result<(), PageFault> {
        let paddr = self.mem.translate(linear, true)?;
        self.store(paddr, Width::W8, u32::from(value));
        Ok(())
    }

    fn read(&mut self, linear: u32, width: Width) -> Result<u32, PageFault> {
        if Self::fits_in_page(linear, width) {
            let paddr = self.mem.translate(linear, false)?;
            return Ok(read_phys(&*self.mem, paddr, width));
        }
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().take(width.bytes() as usize).enumerate() {
            *b = self.read_u8(linear.wrapping_add(i as u32))?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    fn write(&mut self, linear: u32, width: Width, value: u32) -> Result<(), PageFault> {
        if Self::fits_in_page(linear, width) {
            let paddr = self.mem.translate(linear, true)?;
            self.store(paddr, width, value);
            return Ok(());
        }
        let last = linear.wrapping_add(width.bytes() - 1);
        self.mem.translate(linear, true)?;
        self.mem.translate(last, true)?;
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
