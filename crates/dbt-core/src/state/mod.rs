//! Per-CPU execution state consulted by the dispatch loop.

/// Pending exception, interrupt request and exit request state.
pub mod exec_state;

pub use exec_state::{CpuExecState, ExitRequest, InterruptRequest, SingleStep};
