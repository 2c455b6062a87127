//! Main dispatch loop.
//!
//! [`Executor::run`] alternates between two states: delivering the pending
//! exception, and finding, linking and executing blocks until something
//! unwinds. Guest exceptions and exit requests travel as [`LoopExit`]
//! errors; only host-side failures surface as [`ExecError`].

/// Architecture policy hooks.
pub mod policy;

pub use policy::{ArchPolicy, NoInterruptPolicy};

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::diag::ExecDiagnostics;
use crate::state::{CpuExecState, InterruptRequest, SingleStep};
use crate::tb::{
    lock_cache, BlockExit, CodeGenerator, CodeMmu, CodegenError, JmpCache, LookupError, NativeCode,
    NextTb, SharedTbCache, TbId, TbKey,
};
use crate::{ExceptionIndex, ExitCode, LoopExit};

/// CPU as seen by the dispatch loop.
pub trait ExecCpu {
    /// Execution-control state.
    fn exec_state(&self) -> &CpuExecState;

    /// Mutable execution-control state.
    fn exec_state_mut(&mut self) -> &mut CpuExecState;

    /// Lookup key for the block at the current PC.
    fn tb_key(&self) -> TbKey;

    /// Resets the PC to the start of the block compiled under `key`.
    fn restore_pc(&mut self, key: &TbKey);

    /// Returns `true` when a waiting CPU should resume.
    fn has_work(&self) -> bool {
        !self.exec_state().interrupt_request.is_empty()
    }
}

/// Fatal dispatch loop failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// The code generator could not produce a block.
    #[error("code generation failed: {0}")]
    Codegen(#[from] CodegenError),
}

/// Callback run when the loop exits with [`ExitCode::Debug`].
pub type DebugHandler<C> = Box<dyn FnMut(&mut C) + Send>;

enum Stop {
    Unwind,
    Fatal(ExecError),
}

impl From<LoopExit> for Stop {
    fn from(_: LoopExit) -> Self {
        Self::Unwind
    }
}

impl From<ExecError> for Stop {
    fn from(err: ExecError) -> Self {
        Self::Fatal(err)
    }
}

/// Drives one virtual CPU through cached translation blocks.
pub struct Executor<C, G, M, P> {
    cache: SharedTbCache<C>,
    jmp_cache: JmpCache,
    codegen: G,
    mmu: M,
    policy: P,
    debug_handler: Option<DebugHandler<C>>,
    diagnostics: ExecDiagnostics,
    max_nested_exceptions: u32,
}

impl<C, G, M, P> fmt::Debug for Executor<C, G, M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("diagnostics", &self.diagnostics)
            .field("max_nested_exceptions", &self.max_nested_exceptions)
            .field("debug_handler", &self.debug_handler.is_some())
            .finish_non_exhaustive()
    }
}

impl<C, G, M, P> Executor<C, G, M, P>
where
    C: ExecCpu,
    G: CodeGenerator<C>,
    M: CodeMmu<C>,
    P: ArchPolicy<C>,
{
    /// Builds an executor over a (possibly shared) block cache.
    pub fn new(cache: SharedTbCache<C>, codegen: G, mmu: M, policy: P) -> Self {
        let config = lock_cache(&cache).config().clone();
        let jmp_cache = JmpCache::new(&config);
        let max_nested_exceptions = config.max_nested_exceptions;
        Self {
            cache,
            jmp_cache,
            codegen,
            mmu,
            policy,
            debug_handler: None,
            diagnostics: ExecDiagnostics::new(),
            max_nested_exceptions,
        }
    }

    /// Block cache used by this executor.
    #[must_use]
    pub const fn cache(&self) -> &SharedTbCache<C> {
        &self.cache
    }

    /// Jump cache of the CPU driven by this executor.
    #[must_use]
    pub const fn jmp_cache(&self) -> &JmpCache {
        &self.jmp_cache
    }

    /// Mutable jump cache; clear it when the CPU's code mapping changes.
    pub fn jmp_cache_mut(&mut self) -> &mut JmpCache {
        &mut self.jmp_cache
    }

    /// Code generator.
    #[must_use]
    pub const fn codegen(&self) -> &G {
        &self.codegen
    }

    /// Mutable code generator.
    pub fn codegen_mut(&mut self) -> &mut G {
        &mut self.codegen
    }

    /// Architecture policy.
    #[must_use]
    pub const fn policy(&self) -> &P {
        &self.policy
    }

    /// Mutable architecture policy.
    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    /// Code MMU.
    pub fn mmu_mut(&mut self) -> &mut M {
        &mut self.mmu
    }

    /// Loop counters.
    #[must_use]
    pub const fn diagnostics(&self) -> &ExecDiagnostics {
        &self.diagnostics
    }

    /// Installs the debug-exit handler, returning the previous one.
    pub fn set_debug_handler(
        &mut self,
        handler: Option<DebugHandler<C>>,
    ) -> Option<DebugHandler<C>> {
        std::mem::replace(&mut self.debug_handler, handler)
    }

    /// Runs the CPU until the loop exits.
    ///
    /// A waiting CPU without work returns [`ExitCode::Halted`] at once.
    /// Otherwise blocks execute until an exit code is latched; that code is
    /// returned and left pending in the exception index.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] when code generation fails.
    pub fn run(&mut self, cpu: &mut C) -> Result<ExitCode, ExecError> {
        if cpu.exec_state().wfi {
            if !cpu.has_work() {
                return Ok(ExitCode::Halted);
            }
            cpu.exec_state_mut().wfi = false;
        }

        self.diagnostics.record_run();
        self.policy.exec_prologue(cpu);
        cpu.exec_state_mut().exception_index = ExceptionIndex::None;

        let result = loop {
            if let Some(code) = self.check_exception(cpu) {
                break Ok(code);
            }
            match self.dispatch(cpu) {
                Ok(never) => match never {},
                Err(Stop::Unwind) => {
                    cpu.exec_state_mut().current_tb = None;
                    self.diagnostics.record_unwind();
                }
                Err(Stop::Fatal(err)) => {
                    cpu.exec_state_mut().current_tb = None;
                    break Err(err);
                }
            }
        };

        self.policy.exec_epilogue(cpu);
        match &result {
            Ok(code) => debug!("cpu loop exit: {}", code),
            Err(err) => warn!("cpu loop aborted: {}", err),
        }
        result
    }

    fn check_exception(&mut self, cpu: &mut C) -> Option<ExitCode> {
        let mut nested = 0;
        loop {
            let index = match cpu.exec_state().exception_index {
                ExceptionIndex::None => return None,
                ExceptionIndex::Exit(code) => {
                    if code == ExitCode::Debug {
                        if let Some(handler) = self.debug_handler.as_mut() {
                            handler(cpu);
                        }
                    }
                    return Some(code);
                }
                ExceptionIndex::Guest(index) => index,
            };

            self.policy.handle_exception(cpu);
            self.diagnostics.record_exception();

            let state = cpu.exec_state_mut();
            match state.exception_index {
                ExceptionIndex::Exit(ExitCode::Wfi) => {
                    state.exception_index = ExceptionIndex::None;
                    return Some(ExitCode::Wfi);
                }
                ExceptionIndex::Exit(_) => {}
                ExceptionIndex::Guest(next) if next != index => {
                    nested += 1;
                    if nested > self.max_nested_exceptions {
                        warn!(
                            "dropping exception {:#x} after {} nested raises from {:#x}",
                            next, nested, index
                        );
                        state.exception_index = ExceptionIndex::None;
                        self.diagnostics.record_nested_overflow();
                        return None;
                    }
                }
                ExceptionIndex::Guest(_) | ExceptionIndex::None => {
                    state.exception_index = ExceptionIndex::None;
                    return None;
                }
            }
        }
    }

    fn dispatch(&mut self, cpu: &mut C) -> Result<Infallible, Stop> {
        let mut link = NextTb::NONE;
        loop {
            let state = cpu.exec_state_mut();
            let mut request = state.interrupt_request;
            if !request.is_empty() {
                if state.singlestep.contains(SingleStep::NOIRQ) {
                    request.remove(InterruptRequest::SSTEP_MASK);
                }
                if request.contains(InterruptRequest::DEBUG) {
                    state.reset_interrupt(InterruptRequest::DEBUG);
                    return Err(state.raise_exit(ExitCode::Debug).into());
                }
                if self.policy.process_interrupt(request, cpu)? {
                    self.diagnostics.record_interrupt();
                    link = NextTb::NONE;
                }
                let state = cpu.exec_state_mut();
                if state.interrupt_request.contains(InterruptRequest::EXITTB) {
                    state.reset_interrupt(InterruptRequest::EXITTB);
                    link = NextTb::NONE;
                }
            }

            let state = cpu.exec_state_mut();
            if state.exit_request.take() {
                self.diagnostics.record_exit_request();
                return Err(state.raise_exit(ExitCode::Interrupt).into());
            }

            let (id, key, code) = self.next_block(cpu, link)?;

            let state = cpu.exec_state_mut();
            state.current_tb = Some(id);
            if !state.exit_request.is_requested() {
                link = code.execute(cpu, id)?;
                self.diagnostics.record_block();
                if let BlockExit::ExceptionExit { tb } = link.decode() {
                    let restore = lock_cache(&self.cache)
                        .get(tb)
                        .map(|block| block.key)
                        .or_else(|| (tb == id).then_some(key));
                    if let Some(restore) = restore {
                        cpu.restore_pc(&restore);
                    }
                    return Err(cpu.exec_state_mut().raise_exit(ExitCode::Interrupt).into());
                }
            }
            cpu.exec_state_mut().current_tb = None;
        }
    }

    fn next_block(
        &mut self,
        cpu: &mut C,
        link: NextTb,
    ) -> Result<(TbId, TbKey, Arc<dyn NativeCode<C>>), Stop> {
        let mut cache = lock_cache(&self.cache);
        let key = cpu.tb_key();

        // A raised flag means links may be stale; the lookup below consumes it.
        let chained = match link.decode() {
            BlockExit::Chain { from, slot } if !cache.invalidation_flag().is_raised() => {
                cache.follow_link(from, slot, key)
            }
            BlockExit::Chain { .. } | BlockExit::NoLink | BlockExit::ExceptionExit { .. } => None,
        };

        let id = if let Some(id) = chained {
            trace!("chained into {} at pc {:#x}", id, key.pc);
            self.diagnostics.record_chained();
            id
        } else {
            let found = cache.find_fast(cpu, &mut self.jmp_cache, &mut self.codegen, &mut self.mmu);
            let lookup = match found {
                Ok(lookup) => lookup,
                Err(LookupError::NotMapped { pc }) => {
                    drop(cache);
                    self.diagnostics.record_fetch_fault();
                    self.policy.fetch_fault(cpu, pc);
                    let state = cpu.exec_state_mut();
                    if state.exception_index.is_pending() {
                        return Err(state.loop_exit().into());
                    }
                    return Err(state.raise_exit(ExitCode::Interrupt).into());
                }
                Err(LookupError::Codegen(err)) => return Err(ExecError::from(err).into()),
            };
            let link = if lookup.invalidated {
                NextTb::NONE
            } else {
                link
            };
            if let BlockExit::Chain { from, slot } = link.decode() {
                cache.add_jump(from, slot, lookup.id);
            }
            lookup.id
        };

        let Some(block) = cache.get(id) else {
            return Err(cpu.exec_state_mut().raise_exit(ExitCode::Interrupt).into());
        };
        Ok((id, block.key, Arc::clone(&block.code)))
    }
}
