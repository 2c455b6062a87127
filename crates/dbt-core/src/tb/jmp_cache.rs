use std::fmt;

use super::block::TbId;
use crate::config::ExecConfig;

/// Direct-mapped virtual PC to block index, owned by one CPU.
///
/// Entries are hints: every hit is re-validated against the shared cache,
/// so removed blocks never run. The owner must [`clear`](Self::clear) it when
/// the CPU's code mapping changes.
#[derive(Clone)]
pub struct JmpCache {
    entries: Vec<Option<TbId>>,
    page_bits: u32,
    bits: u32,
    epoch: u64,
}

impl fmt::Debug for JmpCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JmpCache")
            .field("bits", &self.bits)
            .field("epoch", &self.epoch)
            .field("occupied", &self.entries.iter().flatten().count())
            .finish()
    }
}

impl JmpCache {
    /// Creates an empty jump cache sized by `config`.
    #[must_use]
    pub fn new(config: &ExecConfig) -> Self {
        Self {
            entries: vec![None; 1 << config.jmp_cache_bits],
            page_bits: config.page_bits,
            bits: config.jmp_cache_bits,
            epoch: 0,
        }
    }

    /// Slot for a virtual PC.
    ///
    /// Low bits of the page number select a group of slots, low bits of the
    /// page offset select the slot inside the group, so consecutive blocks of
    /// one page do not collide.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn hash(&self, pc: u64) -> usize {
        let jmp_page_bits = self.bits / 2;
        let shift = self.page_bits - jmp_page_bits;
        let jmp_page_size = 1_u64 << jmp_page_bits;
        let addr_mask = jmp_page_size - 1;
        let page_mask = (1_u64 << self.bits) - jmp_page_size;
        let tmp = pc ^ (pc >> shift);
        (((tmp >> shift) & page_mask) | (tmp & addr_mask)) as usize
    }

    /// Unvalidated entry for `pc`.
    #[must_use]
    pub fn get(&self, pc: u64) -> Option<TbId> {
        self.entries[self.hash(pc)]
    }

    /// Records `id` as the block for `pc`.
    pub fn insert(&mut self, pc: u64, id: TbId) {
        let slot = self.hash(pc);
        self.entries[slot] = Some(id);
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.fill(None);
    }

    /// Clears the entries when the shared cache was flushed since the last
    /// lookup.
    pub(crate) fn sync(&mut self, epoch: u64) {
        if self.epoch != epoch {
            self.clear();
            self.epoch = epoch;
        }
    }
}
