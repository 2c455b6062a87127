use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::{ExceptionIndex, ExitCode, LoopExit, TbId};

bitflags! {
    /// Interrupt request lines latched on a virtual CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct InterruptRequest: u32 {
        /// External hardware interrupt.
        const HARD = 0x0002;
        /// Leave the current block chain because program flow changed.
        const EXITTB = 0x0004;
        /// Target-specific external line 0.
        const TGT_EXT_0 = 0x0008;
        /// Target-specific external line 1.
        const TGT_EXT_1 = 0x0010;
        /// Halt request.
        const HALT = 0x0020;
        /// Target-specific external line 2.
        const TGT_EXT_2 = 0x0040;
        /// Debug request, raised as a debug exception regardless of masking.
        const DEBUG = 0x0080;
        /// Target-specific internal line 0.
        const TGT_INT_0 = 0x0100;
        /// Target-specific external line 3.
        const TGT_EXT_3 = 0x0200;
        /// Target-specific internal line 1.
        const TGT_INT_1 = 0x0400;
        /// Target-specific internal line 2.
        const TGT_INT_2 = 0x0800;
        /// Target-specific external line 4.
        const TGT_EXT_4 = 0x1000;

        /// External lines suppressed while single-stepping with `NOIRQ`.
        const SSTEP_MASK = Self::HARD.bits()
            | Self::TGT_EXT_0.bits()
            | Self::TGT_EXT_1.bits()
            | Self::TGT_EXT_2.bits()
            | Self::TGT_EXT_3.bits()
            | Self::TGT_EXT_4.bits();
    }
}

bitflags! {
    /// Single-step mode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct SingleStep: u8 {
        /// Single-stepping is active.
        const ENABLE = 0x1;
        /// Do not deliver external interrupts while stepping.
        const NOIRQ = 0x2;
        /// Do not run timers while stepping.
        const NOTIMER = 0x4;
    }
}

/// Shareable exit request flag.
///
/// Clones observe the same flag, so a host thread can hold one clone and ask
/// a running loop to stop at its next check.
#[derive(Debug, Clone, Default)]
pub struct ExitRequest(Arc<AtomicBool>);

impl ExitRequest {
    /// Creates a cleared exit request flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the execution loop to stop.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` when an exit has been requested and not yet consumed.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consumes a pending request, returning whether one was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Execution-control subset of a virtual CPU's state.
#[derive(Debug, Clone, Default)]
pub struct CpuExecState {
    /// Pending exception or loop-exit request.
    pub exception_index: ExceptionIndex,
    /// Latched interrupt request lines.
    pub interrupt_request: InterruptRequest,
    /// External request to leave the execution loop.
    pub exit_request: ExitRequest,
    /// Single-step mode.
    pub singlestep: SingleStep,
    /// CPU is waiting for an interrupt.
    pub wfi: bool,
    /// Block currently executing; `Some` only while control is inside compiled code.
    pub current_tb: Option<TbId>,
}

impl CpuExecState {
    /// Creates an idle execution state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises interrupt request lines.
    pub fn interrupt(&mut self, lines: InterruptRequest) {
        self.interrupt_request |= lines;
    }

    /// Lowers interrupt request lines.
    pub fn reset_interrupt(&mut self, lines: InterruptRequest) {
        self.interrupt_request &= !lines;
    }

    /// Leaves the current block and returns the unwind token.
    ///
    /// The pending exception index is left untouched; callers set it first.
    #[allow(clippy::missing_const_for_fn)]
    pub fn loop_exit(&mut self) -> LoopExit {
        self.current_tb = None;
        LoopExit
    }

    /// Latches a guest exception and returns the unwind token.
    #[allow(clippy::missing_const_for_fn)]
    pub fn raise_exception(&mut self, code: u16) -> LoopExit {
        self.exception_index = ExceptionIndex::Guest(code);
        self.loop_exit()
    }

    /// Latches a loop-exit pseudo exception and returns the unwind token.
    #[allow(clippy::missing_const_for_fn)]
    pub fn raise_exit(&mut self, code: ExitCode) -> LoopExit {
        self.exception_index = ExceptionIndex::Exit(code);
        self.loop_exit()
    }
}
