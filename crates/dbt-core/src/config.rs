//! Sizing and policy configuration for an execution core instance.

use thiserror::Error;

/// Default guest page size exponent (4 KiB pages).
pub const DEFAULT_PAGE_BITS: u32 = 12;
/// Default jump cache size exponent.
pub const DEFAULT_JMP_CACHE_BITS: u32 = 12;
/// Default physical hash table size exponent.
pub const DEFAULT_PHYS_HASH_BITS: u32 = 15;
/// Default number of live blocks before the cache is flushed.
pub const DEFAULT_MAX_BLOCKS: usize = 1 << 16;
/// Default bound on exceptions raised while delivering an exception.
pub const DEFAULT_MAX_NESTED_EXCEPTIONS: u32 = 8;
/// Largest accepted `max_blocks`; block indices must fit an exit word.
pub const MAX_BLOCKS_LIMIT: usize = (1 << 30) - 1;

/// Rejected configuration values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ConfigError {
    /// Page size exponent outside `1..=30`.
    #[error("page_bits {0} is outside 1..=30")]
    PageBits(u32),
    /// Jump cache exponent outside `2..=24` or larger than twice the page exponent.
    #[error("jmp_cache_bits {0} must be in 2..=24 and at most 2 * page_bits")]
    JmpCacheBits(u32),
    /// Physical hash exponent outside `1..=24`.
    #[error("phys_hash_bits {0} is outside 1..=24")]
    PhysHashBits(u32),
    /// Block limit of zero or above [`MAX_BLOCKS_LIMIT`].
    #[error("max_blocks {0} is outside 1..=0x3fff_ffff")]
    MaxBlocks(usize),
}

/// Immutable configuration shared by the block cache and the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ExecConfig {
    /// Guest page size exponent; blocks crossing a page of this size span two pages.
    pub page_bits: u32,
    /// Jump cache holds `1 << jmp_cache_bits` entries.
    pub jmp_cache_bits: u32,
    /// Physical hash table holds `1 << phys_hash_bits` buckets.
    pub phys_hash_bits: u32,
    /// Live block count at which the whole cache is flushed before compiling.
    pub max_blocks: usize,
    /// Exceptions re-handled in a row before the pending index is dropped.
    pub max_nested_exceptions: u32,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            page_bits: DEFAULT_PAGE_BITS,
            jmp_cache_bits: DEFAULT_JMP_CACHE_BITS,
            phys_hash_bits: DEFAULT_PHYS_HASH_BITS,
            max_blocks: DEFAULT_MAX_BLOCKS,
            max_nested_exceptions: DEFAULT_MAX_NESTED_EXCEPTIONS,
        }
    }
}

impl ExecConfig {
    /// Checks that all sizing exponents are usable.
    ///
    /// # Errors
    ///
    /// Returns the first offending field as a [`ConfigError`].
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.page_bits == 0 || self.page_bits > 30 {
            return Err(ConfigError::PageBits(self.page_bits));
        }
        if self.jmp_cache_bits < 2
            || self.jmp_cache_bits > 24
            || self.jmp_cache_bits / 2 > self.page_bits
        {
            return Err(ConfigError::JmpCacheBits(self.jmp_cache_bits));
        }
        if self.phys_hash_bits == 0 || self.phys_hash_bits > 24 {
            return Err(ConfigError::PhysHashBits(self.phys_hash_bits));
        }
        if self.max_blocks == 0 || self.max_blocks > MAX_BLOCKS_LIMIT {
            return Err(ConfigError::MaxBlocks(self.max_blocks));
        }
        Ok(())
    }

    /// Guest page size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        1 << self.page_bits
    }

    /// Mask selecting the page-aligned part of an address.
    #[must_use]
    pub const fn page_mask(&self) -> u64 {
        !(self.page_size() - 1)
    }
}
