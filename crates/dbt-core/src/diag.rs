//! Saturating execution counters kept by the dispatch loop.

/// Counters describing what a dispatch loop has done since creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ExecDiagnostics {
    /// Calls to the loop entry point.
    pub runs: u64,
    /// Blocks that returned from native code.
    pub blocks_executed: u64,
    /// Blocks reached through an installed direct jump.
    pub blocks_chained: u64,
    /// Interrupt requests the architecture policy serviced.
    pub interrupts_serviced: u64,
    /// Guest exceptions handed to the architecture policy.
    pub exceptions_handled: u64,
    /// Exception chains cut off at the nesting bound.
    pub nested_overflows: u64,
    /// Non-local exits caught at the top of the loop.
    pub unwinds: u64,
    /// Code fetches from unmapped addresses.
    pub fetch_faults: u64,
    /// External exit requests honored.
    pub exit_requests: u64,
}

impl ExecDiagnostics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a loop entry.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record_run(&mut self) {
        self.runs = self.runs.saturating_add(1);
    }

    /// Records a block returning from native code.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record_block(&mut self) {
        self.blocks_executed = self.blocks_executed.saturating_add(1);
    }

    /// Records a block reached by following a direct jump.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record_chained(&mut self) {
        self.blocks_chained = self.blocks_chained.saturating_add(1);
    }

    /// Records an interrupt serviced by the policy.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record_interrupt(&mut self) {
        self.interrupts_serviced = self.interrupts_serviced.saturating_add(1);
    }

    /// Records a guest exception delivery.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record_exception(&mut self) {
        self.exceptions_handled = self.exceptions_handled.saturating_add(1);
    }

    /// Records an exception chain dropped at the nesting bound.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record_nested_overflow(&mut self) {
        self.nested_overflows = self.nested_overflows.saturating_add(1);
    }

    /// Records a caught non-local exit.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record_unwind(&mut self) {
        self.unwinds = self.unwinds.saturating_add(1);
    }

    /// Records a fetch from unmapped code.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record_fetch_fault(&mut self) {
        self.fetch_faults = self.fetch_faults.saturating_add(1);
    }

    /// Records an honored exit request.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record_exit_request(&mut self) {
        self.exit_requests = self.exit_requests.saturating_add(1);
    }

    /// Resets all counters to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
