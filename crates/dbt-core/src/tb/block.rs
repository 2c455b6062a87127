use std::fmt;
use std::sync::Arc;

use super::backend::NativeCode;

/// CPU-state subset under which a block was compiled.
///
/// Two blocks with the same `pc` but different `cs_base` or `flags` are
/// distinct translations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TbKey {
    /// Guest virtual program counter.
    pub pc: u64,
    /// Segment or context base.
    pub cs_base: u64,
    /// Architecture mode flags.
    pub flags: u64,
}

impl TbKey {
    /// Builds a key from its three components.
    #[must_use]
    pub const fn new(pc: u64, cs_base: u64, flags: u64) -> Self {
        Self { pc, cs_base, flags }
    }
}

/// Generation-checked handle to a cached block.
///
/// A handle outlives the block it names; lookups through a stale handle
/// fail instead of reaching a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TbId {
    index: u32,
    generation: u32,
}

impl TbId {
    /// Builds a handle from a slot index and the slot's generation.
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the block arena.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when the handle was issued.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tb#{}.{}", self.index, self.generation)
    }
}

/// One compiled translation block.
pub struct TranslationBlock<C> {
    /// Lookup key the block was compiled under.
    pub key: TbKey,
    /// Physical address of the first guest instruction.
    pub phys_pc: u64,
    /// Physical page holding the first instruction.
    pub page_addr: u64,
    /// Physical page of the tail, for blocks crossing a page boundary.
    pub second_page: Option<u64>,
    /// Guest bytes covered by the block.
    pub guest_size: u32,
    /// Compiled code.
    pub code: Arc<dyn NativeCode<C>>,
    /// Outgoing direct jumps, one per exit slot.
    pub jmp_next: [Option<TbId>; 2],
    pub(crate) jmp_incoming: Vec<(TbId, usize)>,
}

impl<C> TranslationBlock<C> {
    /// Returns `true` when the block crosses a page boundary.
    ///
    /// Such blocks are never targets or sources of direct jumps.
    #[must_use]
    pub const fn spans_two_pages(&self) -> bool {
        self.second_page.is_some()
    }

    /// Returns `true` when the block covers any byte of the physical page.
    #[must_use]
    pub fn touches_page(&self, page: u64) -> bool {
        self.page_addr == page || self.second_page == Some(page)
    }

    /// Blocks jumping directly into this one, with the exit slot they use.
    #[must_use]
    pub fn incoming(&self) -> &[(TbId, usize)] {
        &self.jmp_incoming
    }
}

impl<C> fmt::Debug for TranslationBlock<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationBlock")
            .field("key", &self.key)
            .field("phys_pc", &format_args!("{:#x}", self.phys_pc))
            .field("page_addr", &format_args!("{:#x}", self.page_addr))
            .field("second_page", &self.second_page)
            .field("guest_size", &self.guest_size)
            .field("jmp_next", &self.jmp_next)
            .field("jmp_incoming", &self.jmp_incoming)
            .finish_non_exhaustive()
    }
}
