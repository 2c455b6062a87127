use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::block::{TbId, TbKey};
use super::exit::NextTb;
use crate::LoopExit;

/// Natively executable code of one block.
///
/// `execute` runs the block against the CPU and returns the exit word. A
/// guest exception or exit request is reported as `Err(LoopExit)` after the
/// pending exception index has been set.
pub trait NativeCode<C>: Send + Sync {
    /// Runs the block identified by `tb`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopExit`] to unwind to the top of the dispatch loop.
    fn execute(&self, cpu: &mut C, tb: TbId) -> Result<NextTb, LoopExit>;
}

impl<C, F> NativeCode<C> for F
where
    F: Fn(&mut C, TbId) -> Result<NextTb, LoopExit> + Send + Sync,
{
    fn execute(&self, cpu: &mut C, tb: TbId) -> Result<NextTb, LoopExit> {
        self(cpu, tb)
    }
}

/// Output of one successful code generation.
pub struct GeneratedCode<C> {
    /// Executable code.
    pub code: Arc<dyn NativeCode<C>>,
    /// Guest bytes translated, starting at the key's PC.
    pub guest_size: u32,
}

impl<C> GeneratedCode<C> {
    /// Bundles generated code with its guest size.
    #[must_use]
    pub fn new(code: Arc<dyn NativeCode<C>>, guest_size: u32) -> Self {
        Self { code, guest_size }
    }
}

impl<C> fmt::Debug for GeneratedCode<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedCode")
            .field("guest_size", &self.guest_size)
            .finish_non_exhaustive()
    }
}

/// Code generation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    /// The code buffer is full; the cache is flushed and generation retried once.
    #[error("code buffer exhausted")]
    BufferFull,
    /// The guest code at `pc` cannot be translated.
    #[error("cannot translate code at {pc:#x}: {reason}")]
    Untranslatable {
        /// Guest PC of the block.
        pc: u64,
        /// Generator-provided reason.
        reason: String,
    },
}

/// Guest-to-native block compiler.
pub trait CodeGenerator<C> {
    /// Compiles the block starting at `key.pc` under `key`'s CPU mode.
    ///
    /// # Errors
    ///
    /// Returns [`CodegenError`] when no code could be produced.
    fn generate(
        &mut self,
        cpu: &mut C,
        key: TbKey,
        cflags: u32,
    ) -> Result<GeneratedCode<C>, CodegenError>;
}

/// Translation of guest code addresses to physical addresses.
pub trait CodeMmu<C> {
    /// Physical address of the code at `vaddr`, or `None` when unmapped.
    fn code_phys_addr(&mut self, cpu: &mut C, vaddr: u64) -> Option<u64>;
}

/// MMU mapping every virtual address to the same physical address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityMmu;

impl<C> CodeMmu<C> for IdentityMmu {
    fn code_phys_addr(&mut self, _cpu: &mut C, vaddr: u64) -> Option<u64> {
        Some(vaddr)
    }
}
