use std::io;

use thiserror::Error;

use crate::backend::EmitError;
use crate::config::ConfigError;

/// Failures of the dynamic core.
///
/// None of these are guest-visible: guest faults are delivered through
/// [`crate::ExceptionSink`]. An embedder receiving one of these from [`crate::Dynrec::run`] is
/// expected to stop emulation; the cache is not in a state that can be resumed.
#[derive(Debug, Error)]
pub enum DynrecError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to map {size:#x} bytes of executable memory")]
    ArenaMap {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to reprotect code cache range {start:#x}..{end:#x}")]
    Protect {
        start: usize,
        end: usize,
        #[source]
        source: io::Error,
    },

    #[error("ran out of cache blocks")]
    OutOfBlocks,

    #[error("cache block overrun: {written} bytes emitted into a {capacity}-byte span")]
    Overrun { written: usize, capacity: usize },

    #[error("translated block returned invalid exit code {0}")]
    InvalidReturn(u32),

    #[error(transparent)]
    Emit(#[from] EmitError),
}
