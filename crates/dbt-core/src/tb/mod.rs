//! Translation block cache.
//!
//! Compiled blocks are found through two structures: a per-CPU direct-mapped
//! jump cache indexed by virtual PC, and a shared physical hash table indexed
//! by the physical address of the first instruction. Blocks can be linked by direct
//! jumps so that hot paths skip lookup entirely.

/// Code generator, MMU and native code interfaces.
pub mod backend;
/// Blocks, keys and handles.
pub mod block;
/// Physical hash table, linking and invalidation.
pub mod cache;
/// Exit words returned by compiled code.
pub mod exit;
/// Per-CPU jump cache.
pub mod jmp_cache;

pub use backend::{CodeGenerator, CodeMmu, CodegenError, GeneratedCode, IdentityMmu, NativeCode};
pub use block::{TbId, TbKey, TranslationBlock};
pub use cache::{
    lock_cache, InvalidationFlag, LookupError, LookupPath, SharedTbCache, TbCache, TbCacheStats,
    TbLookup,
};
pub use exit::{BlockExit, NextTb};
pub use jmp_cache::JmpCache;
