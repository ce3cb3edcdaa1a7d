//! The executable memory arena holding all generated code.
//!
//! Layout (offsets from [`ExecArena::base_addr`]):
//!
//! - `[0, stub_len)`: one host page holding the backend's entry trampoline and the two link
//!   exit stubs.
//! - `[stub_len, stub_len + cache_size)`: block spans managed by the cache allocator.
//! - `max_block_size` bytes of slack after that, so the last span may overrun its nominal size.
//!
//! Writes go through [`WriteGuard`]. In [`ProtectionMode::WriteXorExecute`] the guard flips the
//! touched host pages to RW on creation and back to RX when it finishes or is dropped, so every
//! emission path leaves the arena executable.

use std::ops::Range;
use std::ptr::NonNull;

use crate::config::ProtectionMode;
use crate::error::DynrecError;

pub struct ExecArena {
    base: NonNull<u8>,
    len: usize,
    stub_len: usize,
    page_size: usize,
    mode: ProtectionMode,
    executable: bool,
}

impl std::fmt::Debug for ExecArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecArena")
            .field("base", &format_args!("{:#x}", self.base_addr()))
            .field("len", &self.len)
            .field("mode", &self.mode)
            .field("executable", &self.executable)
            .finish()
    }
}

impl ExecArena {
    /// Maps a zeroed arena for `cache_size` bytes of blocks plus `slack` bytes of overrun space.
    pub fn allocate(
        cache_size: usize,
        slack: usize,
        mode: ProtectionMode,
    ) -> Result<Self, DynrecError> {
        let page_size = host_page_size();
        let stub_len = page_size;
        let len = round_up(stub_len + cache_size + slack, page_size);
        let (base, executable) = sys::map(len, mode).map_err(|source| DynrecError::ArenaMap {
            size: len,
            source,
        })?;
        tracing::debug!(len, ?mode, executable, "mapped code cache arena");
        Ok(Self {
            base,
            len,
            stub_len,
            page_size,
            mode,
            executable,
        })
    }

    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> ProtectionMode {
        self.mode
    }

    /// Whether code in the arena can be executed by the host CPU.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Offset range reserved for the trampoline and link stubs.
    pub fn stub_range(&self) -> Range<usize> {
        0..self.stub_len
    }

    /// Offset of the first block span.
    pub fn blocks_start(&self) -> usize {
        self.stub_len
    }

    /// Read-only view of the whole arena.
    pub fn code(&self) -> &[u8] {
        // SAFETY: the mapping is `len` bytes, always readable, and only mutated through a
        // `WriteGuard` which borrows the arena mutably.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    /// Makes `range` writable until the returned guard finishes or drops.
    pub fn begin_write(&mut self, range: Range<usize>) -> Result<WriteGuard<'_>, DynrecError> {
        assert!(
            range.start <= range.end && range.end <= self.len,
            "arena write range {range:?} out of bounds (len {:#x})",
            self.len
        );
        if self.mode == ProtectionMode::WriteXorExecute {
            let pages = self.page_span(&range);
            self.protect(pages, sys::Access::ReadWrite)?;
        }
        Ok(WriteGuard {
            arena: self,
            range,
            finished: false,
        })
    }

    fn end_write_make_executable(&mut self, range: Range<usize>) -> Result<(), DynrecError> {
        if self.mode == ProtectionMode::WriteXorExecute {
            let pages = self.page_span(&range);
            self.protect(pages, sys::Access::ReadExecute)?;
        }
        flush_icache(self.base_addr() + range.start, range.len());
        Ok(())
    }

    fn page_span(&self, range: &Range<usize>) -> Range<usize> {
        let start = range.start & !(self.page_size - 1);
        let end = round_up(range.end, self.page_size).min(self.len);
        start..end
    }

    fn protect(&mut self, pages: Range<usize>, access: sys::Access) -> Result<(), DynrecError> {
        if pages.is_empty() || !self.executable {
            return Ok(());
        }
        // SAFETY: `pages` lies within the mapping and is host-page aligned.
        unsafe { sys::protect(self.base.as_ptr().add(pages.start), pages.len(), access) }.map_err(
            |source| DynrecError::Protect {
                start: pages.start,
                end: pages.end,
                source,
            },
        )
    }
}

impl Drop for ExecArena {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` describe the mapping created in `allocate`.
        if let Err(err) = unsafe { sys::unmap(self.base, self.len) } {
            tracing::error!(%err, "failed to unmap code cache arena");
        }
    }
}

/// Scoped write access to a range of the arena.
pub struct WriteGuard<'a> {
    arena: &'a mut ExecArena,
    range: Range<usize>,
    finished: bool,
}

impl WriteGuard<'_> {
    /// Absolute host address of the first writable byte.
    pub fn addr(&self) -> usize {
        self.arena.base_addr() + self.range.start
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the range was bounds-checked in `begin_write` and is writable while the guard
        // lives; the guard holds the only borrow of the arena.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.arena.base.as_ptr().add(self.range.start),
                self.range.len(),
            )
        }
    }

    /// Ends the write window and makes the range executable again.
    pub fn finish(mut self) -> Result<(), DynrecError> {
        self.finished = true;
        self.arena.end_write_make_executable(self.range.clone())
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.arena.end_write_make_executable(self.range.clone()) {
            // No way to continue with a half-protected arena.
            tracing::error!(%err, "failed to restore code cache protection");
            std::process::abort();
        }
    }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn flush_icache(_addr: usize, _len: usize) {
    // x86 snoops self-modified code. Other hosts only run the portable backend, which never
    // executes arena bytes as machine code.
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(unix)]
fn host_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn host_page_size() -> usize {
    4096
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::ptr::NonNull;

    use crate::config::ProtectionMode;

    #[derive(Debug, Clone, Copy)]
    pub(super) enum Access {
        ReadWrite,
        ReadExecute,
    }

    #[cfg(target_os = "macos")]
    const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_JIT;
    #[cfg(not(target_os = "macos"))]
    const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

    pub(super) fn map(len: usize, mode: ProtectionMode) -> io::Result<(NonNull<u8>, bool)> {
        let prot = match mode {
            ProtectionMode::Rwx => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            ProtectionMode::WriteXorExecute => libc::PROT_READ | libc::PROT_WRITE,
        };
        // SAFETY: anonymous private mapping; the kernel picks the address.
        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, MAP_FLAGS, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok((base, true))
    }

    pub(super) unsafe fn protect(ptr: *mut u8, len: usize, access: Access) -> io::Result<()> {
        let prot = match access {
            Access::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Access::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        };
        if libc::mprotect(ptr.cast(), len, prot) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) unsafe fn unmap(base: NonNull<u8>, len: usize) -> io::Result<()> {
        if libc::munmap(base.as_ptr().cast(), len) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Hosts without `mmap`: plain heap memory, usable by the portable backend only.
#[cfg(not(unix))]
mod sys {
    use std::io;
    use std::ptr::NonNull;

    use crate::config::ProtectionMode;

    #[derive(Debug, Clone, Copy)]
    pub(super) enum Access {
        ReadWrite,
        ReadExecute,
    }

    pub(super) fn map(len: usize, _mode: ProtectionMode) -> io::Result<(NonNull<u8>, bool)> {
        let boxed = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed).cast::<u8>();
        let base =
            NonNull::new(ptr).ok_or_else(|| io::Error::other("allocation returned null"))?;
        Ok((base, false))
    }

    pub(super) unsafe fn protect(_ptr: *mut u8, _len: usize, _access: Access) -> io::Result<()> {
        Ok(())
    }

    pub(super) unsafe fn unmap(base: NonNull<u8>, len: usize) -> io::Result<()> {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(base.as_ptr(), len)));
        Ok(())
    }
}
