use super::block::TbId;

const KIND_MASK: u64 = 0b11;
const KIND_EXCEPTION_EXIT: u64 = 2;
const KIND_NO_LINK: u64 = 3;
const INDEX_SHIFT: u32 = 2;
const INDEX_MASK: u64 = 0x3FFF_FFFF;
const GENERATION_SHIFT: u32 = 32;

/// Word returned by compiled code when it leaves a block.
///
/// Layout: bits `0..2` exit kind (`0`/`1` jump slot, `2` exception exit,
/// `3` no link), bits `2..32` block index plus one, bits `32..64` block
/// generation. The zero word names no block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NextTb(u64);

/// Decoded meaning of a [`NextTb`] word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockExit {
    /// No linkable predecessor; the next block is looked up from scratch.
    NoLink,
    /// Block left through a direct-jump slot that may be linked.
    Chain {
        /// Block that exited.
        from: TbId,
        /// Exit slot used, `0` or `1`.
        slot: usize,
    },
    /// Block was interrupted mid-way and wants its PC restored.
    ExceptionExit {
        /// Block whose key holds the PC to restore.
        tb: TbId,
    },
}

impl NextTb {
    /// Word naming no block.
    pub const NONE: Self = Self(0);

    /// Wraps a raw word produced by generated code.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw word.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Exit through jump slot `slot` (`0` or `1`) of `from`.
    #[must_use]
    pub const fn chain(from: TbId, slot: usize) -> Self {
        Self::encode(from, (slot as u64) & 1)
    }

    /// Exception exit from `tb`; the loop restores the PC from its key.
    #[must_use]
    pub const fn exception_exit(tb: TbId) -> Self {
        Self::encode(tb, KIND_EXCEPTION_EXIT)
    }

    /// Exit from `tb` that must not be linked to its successor.
    #[must_use]
    pub const fn no_link(tb: TbId) -> Self {
        Self::encode(tb, KIND_NO_LINK)
    }

    const fn encode(tb: TbId, kind: u64) -> Self {
        let index = ((tb.index() as u64) + 1) & INDEX_MASK;
        Self(((tb.generation() as u64) << GENERATION_SHIFT) | (index << INDEX_SHIFT) | kind)
    }

    /// Block named by the word, if any.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn block(self) -> Option<TbId> {
        let index = (self.0 >> INDEX_SHIFT) & INDEX_MASK;
        if index == 0 {
            return None;
        }
        Some(TbId::new(
            (index - 1) as u32,
            (self.0 >> GENERATION_SHIFT) as u32,
        ))
    }

    /// Decodes the exit kind.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(self) -> BlockExit {
        let Some(tb) = self.block() else {
            return BlockExit::NoLink;
        };
        match self.0 & KIND_MASK {
            KIND_EXCEPTION_EXIT => BlockExit::ExceptionExit { tb },
            KIND_NO_LINK => BlockExit::NoLink,
            slot => BlockExit::Chain {
                from: tb,
                slot: slot as usize,
            },
        }
    }
}
