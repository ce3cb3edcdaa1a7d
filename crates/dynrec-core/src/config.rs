use thiserror::Error;

/// How the code cache arena is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionMode {
    /// Map the whole arena read+write+execute once.
    Rwx,
    /// Keep the arena W^X: each emission flips the touched host pages to RW and back to RX.
    WriteXorExecute,
}

/// Host code generator used for translated blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Native x86-64 machine code (x86-64 unix hosts only).
    Native,
    /// Threaded code stored in the arena and run by a small host-independent interpreter.
    Portable,
}

impl BackendKind {
    /// The fastest backend this host supports.
    pub const fn host_default() -> Self {
        if cfg!(all(target_arch = "x86_64", unix)) {
            BackendKind::Native
        } else {
            BackendKind::Portable
        }
    }

    pub const fn is_available(self) -> bool {
        match self {
            BackendKind::Native => cfg!(all(target_arch = "x86_64", unix)),
            BackendKind::Portable => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be a power of two (got {value})")]
    NotPowerOfTwo { field: &'static str, value: usize },
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("cache_size ({cache_size}) must be at least twice max_block_size ({max_block_size})")]
    CacheTooSmall {
        cache_size: usize,
        max_block_size: usize,
    },
    #[error("hash_shift {0} leaves no page hash buckets")]
    HashShift(u32),
    #[error("code_pages must be at least 2 (got {0})")]
    TooFewPages(usize),
    #[error("backend {0:?} is not available on this host")]
    BackendUnavailable(BackendKind),
}

/// Tuning knobs of the dynamic core.
///
/// None of the defaults is load-bearing beyond the checks in [`DynrecConfig::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynrecConfig {
    /// Bytes of host code the arena can hold.
    pub cache_size: usize,
    /// Minimum span handed out by `open_block`; also the overrun slack after the last span.
    pub max_block_size: usize,
    /// Size of the fixed cache block descriptor pool.
    pub block_count: usize,
    /// Size of the fixed code page monitor pool.
    pub code_pages: usize,
    /// Spans are split on this boundary when a block leaves space unused.
    pub align: usize,
    /// Page offsets are hashed as `offset >> hash_shift`.
    pub hash_shift: u32,
    /// Guest instructions translated into one block at most.
    pub max_instructions: usize,
    /// Rewrites of a byte after which it is treated as data: immediates are read at run time and
    /// blocks starting there are replaced by single interpreter steps.
    pub heavy_rewrite_threshold: u8,
    /// Non-code writes tolerated on a block-less page before its monitor is released.
    pub release_delay: u32,
    /// First allocation of a block's write mask, in bytes.
    pub mask_initial_len: usize,
    /// Growth factor of a block's write mask.
    pub mask_growth: usize,
    pub protection: ProtectionMode,
    pub backend: BackendKind,
}

impl Default for DynrecConfig {
    fn default() -> Self {
        Self {
            cache_size: 8 * 1024 * 1024,
            max_block_size: 8 * 1024,
            block_count: 128 * 1024,
            code_pages: 512,
            align: 16,
            hash_shift: 4,
            max_instructions: 32,
            heavy_rewrite_threshold: 4,
            release_delay: 16,
            mask_initial_len: 64,
            mask_growth: 4,
            protection: ProtectionMode::Rwx,
            backend: BackendKind::host_default(),
        }
    }
}

impl DynrecConfig {
    /// Number of buckets in a page monitor's block hash, including bucket 0 for cross-page
    /// blocks.
    pub const fn hash_buckets(&self) -> usize {
        1 + (crate::PAGE_SIZE >> self.hash_shift)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("max_block_size", self.max_block_size),
            ("align", self.align),
        ] {
            if !value.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo { field, value });
            }
        }
        for (field, value) in [
            ("block_count", self.block_count),
            ("max_instructions", self.max_instructions),
            ("mask_initial_len", self.mask_initial_len),
            ("mask_growth", self.mask_growth),
            ("release_delay", self.release_delay as usize),
            ("heavy_rewrite_threshold", usize::from(self.heavy_rewrite_threshold)),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.cache_size < 2 * self.max_block_size {
            return Err(ConfigError::CacheTooSmall {
                cache_size: self.cache_size,
                max_block_size: self.max_block_size,
            });
        }
        if self.hash_shift >= crate::PAGE_SHIFT {
            return Err(ConfigError::HashShift(self.hash_shift));
        }
        if self.code_pages < 2 {
            return Err(ConfigError::TooFewPages(self.code_pages));
        }
        if !self.backend.is_available() {
            return Err(ConfigError::BackendUnavailable(self.backend));
        }
        Ok(())
    }

    /// A small cache for tests and tools: 256 KiB of code, 4096 blocks, 32 pages.
    pub fn small() -> Self {
        Self {
            cache_size: 256 * 1024,
            block_count: 4096,
            code_pages: 32,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DynrecConfig::default().validate().unwrap();
        DynrecConfig::small().validate().unwrap();
        assert_eq!(DynrecConfig::default().hash_buckets(), 257);
    }

    #[test]
    fn rejects_unusable_geometry() {
        let base = DynrecConfig::small();
        assert_eq!(
            DynrecConfig { align: 24, ..base }.validate(),
            Err(ConfigError::NotPowerOfTwo {
                field: "align",
                value: 24
            })
        );
        assert_eq!(
            DynrecConfig {
                max_instructions: 0,
                ..base
            }
            .validate(),
            Err(ConfigError::Zero {
                field: "max_instructions"
            })
        );
        assert_eq!(
            DynrecConfig {
                cache_size: base.max_block_size,
                ..base
            }
            .validate(),
            Err(ConfigError::CacheTooSmall {
                cache_size: base.max_block_size,
                max_block_size: base.max_block_size,
            })
        );
        assert_eq!(
            DynrecConfig {
                hash_shift: 12,
                ..base
            }
            .validate(),
            Err(ConfigError::HashShift(12))
        );
        assert_eq!(
            DynrecConfig {
                code_pages: 1,
                ..base
            }
            .validate(),
            Err(ConfigError::TooFewPages(1))
        );
    }

    #[test]
    fn portable_backend_is_always_available() {
        assert!(BackendKind::Portable.is_available());
        assert!(BackendKind::host_default().is_available());
    }
}
