//! Dynamic recompiler core for a 32-bit x86 guest.
//!
//! Guest code is translated block by block into host code kept in an executable arena:
//! - [`translate`] decodes guest instructions and lowers them to micro-ops ([`ir`]).
//! - [`backend`] turns micro-ops into host code, natively on x86-64 or as portable threaded code.
//! - [`cache`] owns the block descriptors, their arena spans, the link table and the code page
//!   monitors that invalidate blocks when the guest writes over its own code.
//! - [`Dynrec`] is the dispatch loop tying it together.
//!
//! The interpreter, exception delivery and physical memory are supplied by the embedding machine
//! through [`Platform`] and [`GuestMemory`].

pub mod arena;
pub mod backend;
pub mod cache;
pub mod config;
pub mod flags;
pub mod ir;
pub mod mem;
pub mod platform;
pub mod state;

mod bus;
mod dispatch;
mod error;
mod translate;

pub use arena::ExecArena;
pub use bus::CodeBus;
pub use cache::{BlockId, CacheBlock, CacheStats, CodeCache, CodePageMonitor, LinkTarget, PageId};
pub use config::{BackendKind, ConfigError, DynrecConfig, ProtectionMode};
pub use dispatch::{DispatchStats, Dynrec};
pub use error::DynrecError;
pub use ir::{BlockIr, BlockReturn, MicroOp, Tmp};
pub use mem::{FlatMemory, GuestBus, GuestMemory, PageFault, PageFlags};
pub use platform::{CoreExit, ExceptionSink, Interpreter, Platform};
pub use state::CpuState;

/// Guest pages are 4 KiB.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u32 = (PAGE_SIZE as u32) - 1;
