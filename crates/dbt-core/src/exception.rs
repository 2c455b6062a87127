use thiserror::Error;

/// Raw exception index meaning "no exception pending".
pub const EXCP_NONE: i32 = -1;

/// First raw exception index that requests an exit from the execution loop.
///
/// Raw indices below this threshold are guest exceptions delivered by the
/// architecture exception handler.
pub const EXCP_INTERRUPT: i32 = 0x1_0000;

/// Loop-exit pseudo exceptions returned to the caller of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(i32)]
pub enum ExitCode {
    /// Asynchronous interruption or explicit exit request.
    #[error("asynchronous interruption")]
    Interrupt = 0x1_0000,
    /// Guest executed a halt instruction.
    #[error("halt instruction reached")]
    Hlt = 0x1_0001,
    /// Execution stopped at a breakpoint or after a single step.
    #[error("stopped for debug event")]
    Debug = 0x1_0002,
    /// CPU is halted waiting for an external event.
    #[error("cpu halted")]
    Halted = 0x1_0003,
    /// Guest entered wait-for-interrupt.
    ///
    /// Reported as a plain status of `0` by [`ExitCode::loop_status`]; the
    /// caller resumes the CPU once an interrupt is pending.
    #[error("wait for interrupt")]
    Wfi = 0x1_0004,
}

impl ExitCode {
    /// Converts an exit code to its stable raw exception index.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    /// Integer status of a finished loop run.
    ///
    /// Every code reports its raw index except [`ExitCode::Wfi`], which
    /// reports `0`: entering wait-for-interrupt is a normal return.
    #[must_use]
    pub const fn loop_status(self) -> i32 {
        match self {
            Self::Wfi => 0,
            code => code.as_raw(),
        }
    }

    /// Converts a raw exception index back into an exit code.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0x1_0000 => Some(Self::Interrupt),
            0x1_0001 => Some(Self::Hlt),
            0x1_0002 => Some(Self::Debug),
            0x1_0003 => Some(Self::Halted),
            0x1_0004 => Some(Self::Wfi),
            _ => None,
        }
    }
}

/// Pending exception slot of a virtual CPU.
///
/// A single slot carries three disjoint kinds of value: nothing pending, a
/// guest exception waiting for delivery, or a loop-exit pseudo exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ExceptionIndex {
    /// No exception pending.
    #[default]
    None,
    /// Architecture-defined guest exception number.
    Guest(u16),
    /// Request to leave the execution loop.
    Exit(ExitCode),
}

impl ExceptionIndex {
    /// Returns the raw integer encoding used by generated code.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::None => EXCP_NONE,
            Self::Guest(code) => code as i32,
            Self::Exit(code) => code.as_raw(),
        }
    }

    /// Decodes a raw exception index.
    ///
    /// Returns `None` for negative values other than [`EXCP_NONE`] and for
    /// raw values at or above [`EXCP_INTERRUPT`] that name no exit code.
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw == EXCP_NONE {
            return Some(Self::None);
        }
        if raw >= EXCP_INTERRUPT {
            return ExitCode::from_raw(raw).map(Self::Exit);
        }
        u16::try_from(raw).ok().map(Self::Guest)
    }

    /// Returns `true` when anything is pending.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Returns the exit code when this index requests a loop exit.
    #[must_use]
    pub const fn exit_code(self) -> Option<ExitCode> {
        match self {
            Self::Exit(code) => Some(code),
            Self::None | Self::Guest(_) => None,
        }
    }
}

/// Unwind token that aborts the current unit of native execution.
///
/// Native code, interrupt processing and the loop itself return this as an
/// error to transfer control back to the exception check at the top of the
/// dispatch loop. The reason for the exit is whatever was left in the CPU's
/// pending [`ExceptionIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Error)]
#[error("cpu loop exit")]
pub struct LoopExit;
