//! Execution core of a dynamic binary translation CPU emulator.
//!
//! The crate caches compiled translation blocks, drives their execution
//! while servicing interrupts and exceptions, and dispatches guest system
//! register accesses through a sparse descriptor table. Instruction
//! semantics and code generation live behind the traits in [`tb`] and
//! [`exec`].

/// Sizing and policy configuration.
pub mod config;
pub use config::{
    ConfigError, ExecConfig, DEFAULT_JMP_CACHE_BITS, DEFAULT_MAX_BLOCKS,
    DEFAULT_MAX_NESTED_EXCEPTIONS, DEFAULT_PAGE_BITS, DEFAULT_PHYS_HASH_BITS, MAX_BLOCKS_LIMIT,
};

/// Pending exception slot, loop exit codes and the unwind token.
pub mod exception;
pub use exception::{ExceptionIndex, ExitCode, LoopExit, EXCP_INTERRUPT, EXCP_NONE};

/// Execution-control state of a virtual CPU.
pub mod state;
pub use state::{CpuExecState, ExitRequest, InterruptRequest, SingleStep};

/// Dispatch loop counters.
pub mod diag;
pub use diag::ExecDiagnostics;

/// System and coprocessor register dispatch table.
pub mod sysreg;
pub use sysreg::{
    expanded_count, FieldAccessor, IoSerializer, ReadFn, RegisterDescriptor, RegisterError,
    RegisterFlags, RegisterKey, RegisterTable, RegisterWidth, Selector, TableEntry, WriteFn,
};

/// Translation block cache and code generation interfaces.
pub mod tb;
pub use tb::{
    lock_cache, BlockExit, CodeGenerator, CodeMmu, CodegenError, GeneratedCode, IdentityMmu,
    InvalidationFlag, JmpCache, LookupError, LookupPath, NativeCode, NextTb, SharedTbCache, TbCache,
    TbCacheStats, TbId, TbKey, TbLookup, TranslationBlock,
};

/// Main dispatch loop.
pub mod exec;
pub use exec::{ArchPolicy, DebugHandler, ExecCpu, ExecError, Executor, NoInterruptPolicy};
